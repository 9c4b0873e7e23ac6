//! Region scans by recursive cell expansion and neighbor walking.
//!
//! One state machine serves every `$within` shape. Expansion starts at
//! the region's center cell, drains it through bidirectional cursors,
//! and widens the prefix until the cell covers the region's
//! characteristic size; then the eight neighbor cells are visited the
//! same way. The machine is cooperative: `fill_stack` checks at most a
//! caller-chosen number of keys before suspending, and resumes
//! deterministically.

use std::collections::VecDeque;

use tracing::debug;

use meridian_common::{MeridianError, Result};
use serde_json::Value;

use crate::accumulator::{Accumulator, Screen};
use crate::geometry::{sphere_dist_deg, x_scan_distance, DistType, Point, Polygon, Rect};
use crate::hash::GeoHash;
use crate::index::Geo2dIndex;
use crate::storage::{
    Direction, DocStore, GeoPoint, IndexKey, KeyNode, KeyTree, Matcher, TreeCursor,
};

/// Keys checked per `fill_stack` quantum when driven as a cursor.
pub const MAX_POINTS_HEURISTIC: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrowseState {
    Start,
    DoingExpand,
    DoneNeighbor,
    Done,
}

/// The region under scan, with its shape-specific tests.
#[derive(Debug)]
pub enum RegionShape {
    Circle {
        dist_type: DistType,
        start: GeoHash,
        start_pt: Point,
        max_distance: f64,
        x_scan: f64,
        y_scan: f64,
        bbox: Rect,
    },
    Box {
        want: Rect,
        want_len: f64,
        fudge: f64,
        start: GeoHash,
    },
    Polygon {
        poly: Polygon,
        bounds: Rect,
        max_dim: f64,
        start: GeoHash,
    },
}

impl RegionShape {
    /// Planar circle: scan box is the radius plus one cell of error.
    pub fn circle(index: &Geo2dIndex, center: Point, max_distance: f64) -> Result<Self> {
        if !(max_distance > 0.0) {
            return Err(MeridianError::InvalidQuery(
                "need a max distance > 0".to_string(),
            ));
        }
        let start = index.hash_point(&center)?;
        let scan = max_distance + index.error();
        Ok(RegionShape::Circle {
            dist_type: DistType::Plain,
            start,
            start_pt: center,
            max_distance,
            x_scan: scan,
            y_scan: scan,
            bbox: Rect::new(
                Point::new(center.x - scan, center.y - scan),
                Point::new(center.x + scan, center.y + scan),
            ),
        })
    }

    /// Spherical circle: the radius is in radians, and the x scan
    /// distance widens with latitude.
    pub fn circle_sphere(index: &Geo2dIndex, center: Point, max_distance: f64) -> Result<Self> {
        if !(max_distance > 0.0) {
            return Err(MeridianError::InvalidQuery(
                "need a max distance > 0".to_string(),
            ));
        }
        if !(max_distance < std::f64::consts::PI) {
            return Err(MeridianError::InvalidQuery(
                "Spherical MaxDistance > PI. Are you sure you are using radians?".to_string(),
            ));
        }

        let y_scan = max_distance.to_degrees() + index.error();
        let x_scan = x_scan_distance(center.y, y_scan);

        if !(center.x + x_scan < 180.0
            && center.x - x_scan > -180.0
            && center.y + y_scan < 90.0
            && center.y - y_scan > -90.0)
        {
            return Err(MeridianError::InvalidQuery(
                "Spherical distance would require wrapping, which isn't implemented yet"
                    .to_string(),
            ));
        }

        let start = index.hash_point(&center)?;
        Ok(RegionShape::Circle {
            dist_type: DistType::Sphere,
            start,
            start_pt: center,
            max_distance,
            x_scan,
            y_scan,
            bbox: Rect::new(
                Point::new(center.x - x_scan, center.y - y_scan),
                Point::new(center.x + x_scan, center.y + y_scan),
            ),
        })
    }

    /// Axis-aligned box, normalized and clamped to the index domain.
    pub fn rect(index: &Geo2dIndex, a: Point, b: Point) -> Result<Self> {
        let mut want = Rect::new(a, b);
        if want.min.x > want.max.x {
            std::mem::swap(&mut want.min.x, &mut want.max.x);
        }
        if want.min.y > want.max.y {
            std::mem::swap(&mut want.min.y, &mut want.max.y);
        }
        want.min.x = want.min.x.max(index.domain_min());
        want.min.y = want.min.y.max(index.domain_min());
        want.max.x = want.max.x.min(index.domain_max());
        want.max.y = want.max.y.min(index.domain_max());

        if !(want.area() > 0.0) {
            return Err(MeridianError::InvalidQuery("need an area > 0".to_string()));
        }

        let center = want.center();
        let start = index.hash(center.x, center.y)?;
        let fudge = index.error();
        let want_len = fudge + f64::max(want.max.x - want.min.x, want.max.y - want.min.y);

        Ok(RegionShape::Box {
            want,
            want_len,
            fudge,
            start,
        })
    }

    /// Polygon region, expanded from its centroid.
    pub fn polygon(index: &Geo2dIndex, points: Vec<Point>) -> Result<Self> {
        if points.len() < 3 {
            return Err(MeridianError::InvalidQuery(
                "polygon must be defined by three points or more".to_string(),
            ));
        }
        let poly = Polygon::new(points);
        let bounds = poly.bounds();
        let max_dim = bounds.max_dim();
        let start = index.hash_point(&poly.centroid())?;
        Ok(RegionShape::Polygon {
            poly,
            bounds,
            max_dim,
            start,
        })
    }

    /// The normalized region of a box shape.
    pub fn box_bounds(&self) -> Option<&Rect> {
        match self {
            RegionShape::Box { want, .. } => Some(want),
            _ => None,
        }
    }

    /// The cell the first expansion starts from.
    fn expand_start(&self) -> GeoHash {
        match self {
            RegionShape::Circle { start, .. }
            | RegionShape::Box { start, .. }
            | RegionShape::Polygon { start, .. } => *start,
        }
    }

    /// Whether a cell of the given edge covers the region's size.
    fn fits_in_box(&self, width: f64) -> bool {
        match self {
            RegionShape::Circle { x_scan, y_scan, .. } => width >= f64::max(*x_scan, *y_scan),
            RegionShape::Box { want_len, .. } => width >= *want_len,
            RegionShape::Polygon { max_dim, .. } => *max_dim <= width,
        }
    }

    /// Whether a cell could overlap the region at all.
    fn intersects_rect(&self, cell: &Rect) -> bool {
        let bounds = match self {
            RegionShape::Circle { bbox, .. } => bbox,
            RegionShape::Box { want, .. } => want,
            RegionShape::Polygon { bounds, .. } => bounds,
        };
        bounds.intersects_fraction(cell) > 0.0
    }

    /// The approximate-then-exact membership test for one key.
    ///
    /// Returns the approximate distance when the key passes. Exact
    /// re-checks consult the document's raw locations; any location
    /// that fails to parse is silently skipped.
    fn check_distance(
        &self,
        index: &Geo2dIndex,
        node: &KeyNode,
        store: &dyn DocStore,
    ) -> Option<f64> {
        let h = node.key.hash;
        match self {
            RegionShape::Circle {
                dist_type,
                start,
                start_pt,
                max_distance,
                ..
            } => {
                let (d, error) = match dist_type {
                    DistType::Plain => (index.distance(start, &h), index.error()),
                    DistType::Sphere => (
                        sphere_dist_deg(start_pt, &index.point(&h)),
                        index.error_sphere(),
                    ),
                };

                if d >= max_distance - error && d <= max_distance + error {
                    // Inside the error band around the rim: decide from
                    // the raw locations.
                    for p in raw_points(index, node, store) {
                        let exact_in = match dist_type {
                            DistType::Plain => start_pt.distance_within(&p, *max_distance),
                            DistType::Sphere => {
                                // Spherical math is the expensive path;
                                // only re-check the location this key
                                // hashed from.
                                match index.hash_point(&p) {
                                    Ok(ph) if ph == h => {
                                        sphere_dist_deg(start_pt, &p) <= *max_distance
                                    }
                                    _ => false,
                                }
                            }
                        };
                        if exact_in {
                            return Some(d);
                        }
                    }
                    return None;
                }

                (d <= *max_distance).then_some(d)
            }

            RegionShape::Box { want, fudge, .. } => {
                let approx = index.point(&h);
                let approx_inside = want.inside(&approx, *fudge);

                if approx_inside && want.on_boundary(&approx, *fudge) {
                    for p in raw_points(index, node, store) {
                        if want.inside(&p, 0.0) {
                            return Some(0.0);
                        }
                    }
                    return None;
                }

                approx_inside.then_some(0.0)
            }

            RegionShape::Polygon { poly, .. } => {
                let p = index.point(&h);
                let verdict = poly.contains_fudge(&p, index.error());
                if verdict != 0 {
                    return (verdict > 0).then_some(0.0);
                }

                // Indeterminate within the error band: exact ray cast
                // on the locations hashed to this key.
                for p in raw_points(index, node, store) {
                    match index.hash_point(&p) {
                        Ok(ph) if ph == h => {}
                        _ => continue,
                    }
                    if poly.contains(&p) {
                        return Some(0.0);
                    }
                }
                None
            }
        }
    }
}

/// The parsed raw locations of a key's document.
fn raw_points(index: &Geo2dIndex, node: &KeyNode, store: &dyn DocStore) -> Vec<Point> {
    let Some(doc) = store.document(node.loc) else {
        return Vec::new();
    };
    index
        .locations(doc)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|loc| Point::from_value(loc).ok())
        .collect()
}

/// Cursor over every index key whose cell could overlap a region.
pub struct RegionBrowse<'a> {
    index: &'a Geo2dIndex,
    tree: &'a dyn KeyTree,
    store: &'a dyn DocStore,
    pub acc: Accumulator,
    matcher: Option<Box<dyn Matcher>>,
    shape: RegionShape,

    state: BrowseState,
    neighbor: i32,
    prefix: GeoHash,
    center_prefix: GeoHash,
    center_rect: Rect,
    min: TreeCursor<'a>,
    max: TreeCursor<'a>,
    checked: u64,

    cur: Option<GeoPoint>,
    stack: VecDeque<GeoPoint>,
    first_call: bool,
    nscanned: u64,
}

impl<'a> RegionBrowse<'a> {
    pub fn new(
        index: &'a Geo2dIndex,
        tree: &'a dyn KeyTree,
        store: &'a dyn DocStore,
        shape: RegionShape,
        matcher: Option<Box<dyn Matcher>>,
    ) -> Self {
        RegionBrowse {
            index,
            tree,
            store,
            acc: Accumulator::new(),
            matcher,
            shape,
            state: BrowseState::Start,
            neighbor: -1,
            prefix: GeoHash::unconstrained(),
            center_prefix: GeoHash::unconstrained(),
            center_rect: Rect::default(),
            min: TreeCursor::null(tree),
            max: TreeCursor::null(tree),
            checked: 0,
            cur: None,
            stack: VecDeque::new(),
            first_call: true,
            nscanned: 0,
        }
    }

    pub fn nscanned(&self) -> u64 {
        self.nscanned
    }

    /// Whether the expansion still has cells to visit.
    pub fn more_to_do(&self) -> bool {
        self.state != BrowseState::Done
    }

    /// True while a current result is available.
    pub fn ok(&mut self) -> bool {
        let first = self.first_call;
        if first {
            self.fill_stack(MAX_POINTS_HEURISTIC);
            self.first_call = false;
        }
        if self.cur.is_some() || !self.stack.is_empty() {
            if first {
                self.nscanned += 1;
            }
            return true;
        }

        while self.more_to_do() {
            self.fill_stack(MAX_POINTS_HEURISTIC);
            if self.cur.is_some() {
                if first {
                    self.nscanned += 1;
                }
                return true;
            }
        }

        false
    }

    /// Steps to the next result.
    pub fn advance(&mut self) -> bool {
        self.cur = None;

        if let Some(next) = self.stack.pop_front() {
            self.cur = Some(next);
            self.nscanned += 1;
            return true;
        }

        if !self.more_to_do() {
            return false;
        }
        while self.cur.is_none() && self.more_to_do() {
            self.fill_stack(MAX_POINTS_HEURISTIC);
        }
        if self.cur.is_some() {
            self.nscanned += 1;
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> Option<&GeoPoint> {
        self.cur.as_ref()
    }

    /// Releases the B-tree positions, e.g. on cancellation between
    /// quanta.
    pub fn release_positions(&mut self) {
        self.min = TreeCursor::null(self.tree);
        self.max = TreeCursor::null(self.tree);
    }

    /// Runs the expansion for at most `max_to_check` key checks, then
    /// suspends. Calling again resumes where it stopped.
    pub fn fill_stack(&mut self, max_to_check: u64) {
        let max_checked = self.checked + max_to_check;
        let mut is_neighbor = self.center_prefix.constrains();

        if self.state == BrowseState::Start {
            if !is_neighbor {
                self.prefix = self.shape.expand_start();
            }
            debug!(prefix = %self.prefix, "browse: opening cursors");

            let key = IndexKey::prefix(self.prefix);
            self.min = TreeCursor::locate(self.tree, &key, Direction::Reverse);
            self.max = TreeCursor::locate(self.tree, &key, Direction::Forward);

            if self.min.is_null() && self.max.is_null() {
                self.state = if is_neighbor {
                    BrowseState::DoneNeighbor
                } else {
                    BrowseState::Done
                };
            } else {
                if let Some(node) = self.min.node() {
                    self.checked += 1;
                    self.visit(node);
                }
                if let Some(node) = self.max.node() {
                    self.checked += 1;
                    self.visit(node);
                }
                self.state = BrowseState::DoingExpand;
            }
        }

        if self.state == BrowseState::DoingExpand {
            loop {
                debug!(prefix = %self.prefix, "browse: expanding cell");

                loop {
                    if !self.min.has_prefix(&self.prefix) {
                        break;
                    }
                    if !self.step(Direction::Reverse) {
                        break;
                    }
                    if self.checked >= max_checked {
                        break;
                    }
                }
                loop {
                    if !self.max.has_prefix(&self.prefix) {
                        break;
                    }
                    if !self.step(Direction::Forward) {
                        break;
                    }
                    if self.checked >= max_checked {
                        break;
                    }
                }

                if self.checked >= max_checked {
                    // Quantum used up; the caller resumes later.
                    return;
                }

                if !self.prefix.constrains() {
                    self.state = BrowseState::Done;
                    return;
                }

                if !self.shape.fits_in_box(self.index.size_edge(&self.prefix)) {
                    self.prefix = self.prefix.parent();
                    continue;
                }

                self.state = BrowseState::DoneNeighbor;
                self.neighbor += 1;
                break;
            }
        }

        if self.state == BrowseState::DoneNeighbor {
            while self.neighbor < 9 {
                if !is_neighbor {
                    self.center_prefix = self.prefix;
                    self.center_rect = self.index.cell_rect(&self.center_prefix);
                    is_neighbor = true;
                }

                let i = (self.neighbor / 3) - 1;
                let j = (self.neighbor % 3) - 1;

                if (i == 0 && j == 0)
                    || (i < 0 && self.center_rect.min.x <= self.index.domain_min())
                    || (j < 0 && self.center_rect.min.y <= self.index.domain_min())
                    || (i > 0 && self.center_rect.max.x >= self.index.domain_max())
                    || (j > 0 && self.center_rect.max.y >= self.index.domain_max())
                {
                    // The center cell, or a neighbor that would wrap
                    // across the domain edge.
                    self.neighbor += 1;
                    continue;
                }

                let next = self.center_prefix.shifted(i, j);
                self.prefix = next;
                debug!(neighbor = self.neighbor, prefix = %next, "browse: neighbor cell");

                if self.shape.intersects_rect(&self.index.cell_rect(&next)) {
                    // Restart expansion inside the neighbor; the
                    // recursion carries the shared neighbor counter the
                    // rest of the way.
                    self.state = BrowseState::Start;
                    self.fill_stack(max_checked.saturating_sub(self.checked));
                    return;
                }

                self.neighbor += 1;
            }

            self.state = BrowseState::Done;
        }
    }

    /// Advances one cursor and visits the entry it lands on.
    fn step(&mut self, direction: Direction) -> bool {
        let cur = match direction {
            Direction::Reverse => &mut self.min,
            Direction::Forward => &mut self.max,
        };
        if !cur.advance(direction) {
            return false;
        }
        if let Some(node) = cur.node() {
            self.checked += 1;
            self.visit(node);
        }
        true
    }

    /// Dedup, shape check, cached residual predicate, then collection.
    fn visit(&mut self, node: KeyNode) {
        if !self.acc.observe(&node) {
            return;
        }
        if self
            .shape
            .check_distance(self.index, &node, self.store)
            .is_none()
        {
            return;
        }
        let new_doc = match self.acc.residual(&node, self.matcher.as_deref(), self.store) {
            Screen::Drop => return,
            Screen::Keep { new_doc } => new_doc,
        };
        if new_doc {
            if let Some(doc) = self.store.document(node.loc).cloned() {
                self.push_result(node, doc);
            }
        }
        self.acc.found += 1;
    }

    fn push_result(&mut self, node: KeyNode, doc: Value) {
        let point = GeoPoint::unmeasured(node, doc);
        if self.cur.is_none() {
            self.cur = Some(point);
        } else {
            self.stack.push_back(point);
        }
    }
}
