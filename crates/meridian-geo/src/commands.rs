//! Command-level entry points: geoNear, geoCluster, geoWalk.

use std::f64::consts::PI;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::debug;

use meridian_common::document::as_number;
use meridian_common::{MeridianError, Result};

use crate::browse::{RegionBrowse, RegionShape};
use crate::geometry::{DistType, Point, Rect};
use crate::hash::GeoHash;
use crate::index::Geo2dIndex;
use crate::near::NearSearch;
use crate::storage::{
    Direction, DocStore, IndexKey, KeyTree, Matcher, QueryMatcher, TreeCursor,
};

fn filter_matcher(cmd: &Value, index: &Geo2dIndex) -> Option<Box<dyn Matcher>> {
    let filter = cmd.get("query")?;
    if !filter.is_object() {
        return None;
    }
    let matcher = QueryMatcher::new(filter, index.geo_field());
    if matcher.is_trivial() {
        None
    } else {
        Some(Box::new(matcher))
    }
}

/// Runs a nearest-neighbor search and returns results with exact
/// distances plus execution stats.
///
/// Arguments: `near` (required), `num`, `query`, `maxDistance`,
/// `spherical`, `distanceMultiplier`, `start` (hash-string override).
pub fn geo_near(
    index: &Geo2dIndex,
    tree: &dyn KeyTree,
    store: &dyn DocStore,
    cmd: &Value,
) -> Result<Value> {
    let started = Instant::now();

    let num_wanted = cmd
        .get("num")
        .and_then(as_number)
        .map(|n| n as usize)
        .unwrap_or(100);

    let near_val = cmd
        .get("near")
        .ok_or_else(|| MeridianError::InvalidQuery("'near' param missing/invalid".to_string()))?;
    let near_hash = index.to_hash(near_val)?;
    let origin = Point::from_value(near_val)?;

    let max_distance = cmd
        .get("maxDistance")
        .and_then(as_number)
        .unwrap_or(f64::MAX);

    let dist_type = if cmd.get("spherical").and_then(Value::as_bool).unwrap_or(false) {
        DistType::Sphere
    } else {
        DistType::Plain
    };

    let mut search = NearSearch::new(
        index,
        tree,
        store,
        origin,
        num_wanted,
        filter_matcher(cmd, index),
        max_distance,
        dist_type,
    )?;

    if let Some(start) = cmd.get("start").and_then(Value::as_str) {
        search.set_start(start.parse()?);
    }

    search.exec()?;

    let distance_multiplier = cmd
        .get("distanceMultiplier")
        .and_then(as_number)
        .unwrap_or(1.0);

    let mut results = Vec::new();
    let mut total_distance = 0.0;
    for p in search.hopper.points() {
        let dis = distance_multiplier * p.exact_distance;
        total_distance += dis;
        results.push(json!({ "dis": dis, "obj": p.doc }));
    }

    let avg_distance = if results.is_empty() {
        0.0
    } else {
        total_distance / results.len() as f64
    };

    Ok(json!({
        "near": near_hash.to_string(),
        "results": results,
        "stats": {
            "time": started.elapsed().as_millis() as u64,
            "btreelocs": search.nscanned(),
            "nscanned": search.hopper.acc.looked_at,
            "objectsLoaded": search.hopper.acc.objects_loaded,
            "avgDistance": avg_distance,
            "maxDistance": search.hopper.farthest(),
        },
    }))
}

// The cluster projection works in Web Mercator space, so its latitude
// clamp is the Mercator limit rather than the index domain.
const MIN_LAT: f64 = -85.05112878;
const MAX_LAT: f64 = 85.05112878;

fn point_to_projection(p: &Point) -> Point {
    let y = p.y.clamp(MIN_LAT, MAX_LAT);
    let x = (p.x + 180.0) / 360.0;
    let sin_y = (y * PI / 180.0).sin();
    let y = 0.5 - ((1.0 + sin_y) / (1.0 - sin_y)).ln() / (4.0 * PI);
    Point::new(x, y)
}

fn projection_to_point(p: &Point) -> Point {
    Point::new(
        (p.x - 0.5) * 360.0,
        90.0 - 360.0 * ((p.y - 0.5) * 2.0 * PI).exp().atan() / PI,
    )
}

/// A result document pinned to one of its raw locations.
#[derive(Debug, Clone)]
struct GeoMarker {
    point: Point,
    obj: Value,
}

/// A running cluster: an averaged center, the raw bounds of its
/// members, and a display box of fixed projected size around the
/// center.
struct ClusterBox {
    rect: Rect,
    bounds: Rect,
    count: u64,
    marker: Option<GeoMarker>,
    extend_distance: f64,
    center_x: f64,
    center_y: f64,
}

impl ClusterBox {
    fn new(extend_distance: f64) -> Self {
        ClusterBox {
            rect: Rect::default(),
            bounds: Rect::default(),
            count: 0,
            marker: None,
            extend_distance,
            center_x: 0.0,
            center_y: 0.0,
        }
    }

    fn inside(&self, p: &Point) -> bool {
        self.rect.inside(p, 0.0)
    }

    fn center(&self) -> Point {
        Point::new(self.center_x, self.center_y)
    }

    fn add_point(&mut self, poi: Point, marker: GeoMarker) {
        if self.count == 0 {
            self.bounds = Rect::new(poi, poi);
            self.center_x = poi.x;
            self.center_y = poi.y;
            self.marker = Some(marker);
        } else {
            self.bounds.extend(poi);
            let n = self.count as f64;
            self.center_x = (poi.x + self.center_x * n) / (n + 1.0);
            self.center_y = (poi.y + self.center_y * n) / (n + 1.0);
        }
        self.refresh_rect();
        self.count += 1;
    }

    /// Re-centers the catchment box in projection space.
    fn refresh_rect(&mut self) {
        let cen = point_to_projection(&self.center());
        self.rect.min = projection_to_point(&Point::new(
            cen.x - self.extend_distance,
            cen.y + self.extend_distance,
        ));
        self.rect.max = projection_to_point(&Point::new(
            cen.x + self.extend_distance,
            cen.y - self.extend_distance,
        ));
    }

    fn to_value(&self) -> Value {
        json!({
            "bounds": [
                [self.bounds.min.x, self.bounds.min.y],
                [self.bounds.max.x, self.bounds.max.y],
            ],
            "count": self.count,
            "center": [self.center_x, self.center_y],
        })
    }
}

/// Scans a box region and groups the matching locations into clusters
/// sized relative to the viewport.
///
/// Arguments: `box` (required), `query`, `disableCluster`, `gridSize`
/// (default 5). Single-member clusters are demoted to plain markers.
pub fn geo_cluster(
    index: &Geo2dIndex,
    tree: &dyn KeyTree,
    store: &dyn DocStore,
    cmd: &Value,
) -> Result<Value> {
    let started = Instant::now();

    let box_val = cmd
        .get("box")
        .filter(|v| v.is_object() || v.is_array())
        .ok_or_else(|| {
            MeridianError::InvalidQuery("'box' has to take an object or array".to_string())
        })?;
    let vals = meridian_common::document::values_of(box_val);
    if vals.len() != 2 {
        return Err(MeridianError::InvalidQuery(
            "'box' needs 2 fields (bottomLeft,topRight)".to_string(),
        ));
    }

    let need_cluster = !cmd
        .get("disableCluster")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let grid_size = cmd.get("gridSize").and_then(as_number).unwrap_or(5.0);

    let shape = RegionShape::rect(index, Point::from_value(vals[0])?, Point::from_value(vals[1])?)?;
    let want = shape
        .box_bounds()
        .copied()
        .ok_or_else(|| MeridianError::Internal("cluster scan requires a box region".to_string()))?;

    let min_pro = point_to_projection(&want.min);
    let max_pro = point_to_projection(&want.max);
    let extend_distance = f64::min(max_pro.x - min_pro.x, min_pro.y - max_pro.y) / grid_size;

    let mut browse = RegionBrowse::new(index, tree, store, shape, filter_matcher(cmd, index));

    let mut clusters: Vec<ClusterBox> = Vec::new();
    let mut markers: Vec<GeoMarker> = Vec::new();

    while browse.ok() {
        if let Some(point) = browse.current() {
            let doc = point.doc.clone();
            for loc in index.locations(&doc).unwrap_or_default() {
                let Ok(poi) = Point::from_value(loc) else {
                    continue;
                };
                if !want.inside(&poi, 0.0) {
                    continue;
                }
                let marker = GeoMarker {
                    point: poi,
                    obj: doc.clone(),
                };
                if need_cluster {
                    match clusters.iter_mut().find(|c| c.inside(&poi)) {
                        Some(cluster) => cluster.add_point(poi, marker),
                        None => {
                            let mut cluster = ClusterBox::new(extend_distance);
                            cluster.add_point(poi, marker);
                            clusters.push(cluster);
                        }
                    }
                } else {
                    markers.push(marker);
                }
            }
        }
        if !browse.advance() {
            break;
        }
    }

    let mut cluster_arr = Vec::new();
    for cluster in &clusters {
        if cluster.count == 1 {
            if let Some(marker) = &cluster.marker {
                markers.push(marker.clone());
            }
        } else if cluster.count > 0 {
            cluster_arr.push(cluster.to_value());
        }
    }

    let marker_arr: Vec<Value> = markers
        .iter()
        .map(|m| json!({ "point": [m.point.x, m.point.y], "obj": m.obj }))
        .collect();

    Ok(json!({
        "clusters": cluster_arr,
        "markers": marker_arr,
        "stats": {
            "timems": started.elapsed().as_millis() as u64,
            "nscanned": browse.nscanned(),
        },
    }))
}

/// Diagnostic dump of the index in key order.
pub fn geo_walk(
    index: &Geo2dIndex,
    tree: &dyn KeyTree,
    store: &dyn DocStore,
    max: usize,
) -> Result<Value> {
    let first = IndexKey::prefix(GeoHash::unconstrained());
    let mut cur = TreeCursor::locate(tree, &first, Direction::Forward);

    let mut entries = Vec::new();
    while entries.len() < max {
        let Some(node) = cur.node() else { break };
        let h = node.key.hash;
        let doc = store.document(node.loc);
        let id = doc
            .and_then(|d| d.get("_id"))
            .cloned()
            .unwrap_or(Value::Null);
        let loc = doc
            .and_then(|d| {
                meridian_common::document::fields_dotted(d, index.geo_field())
                    .first()
                    .copied()
            })
            .cloned()
            .unwrap_or(Value::Null);
        debug!(hash = %h, raw = h.value(), %id, "geoWalk entry");
        entries.push(json!({
            "hash": h.to_string(),
            "raw": h.value(),
            "loc": loc,
            "id": id,
        }));
        if !cur.advance(Direction::Forward) {
            break;
        }
    }

    Ok(json!({ "entries": entries }))
}
