//! k-nearest search by geohash prefix expansion.
//!
//! Phase 1 walks outward from the origin's full-precision hash,
//! widening the prefix one level at a time and draining each level in
//! both key directions. Phase 2 derives a bounding box from the current
//! farthest accepted point and sweeps the box's covering cell plus its
//! eight neighbors, re-checking every candidate exactly.

use ordered_float::OrderedFloat;
use tracing::debug;

use meridian_common::Result;

use crate::accumulator::{Accumulator, Screen};
use crate::geometry::{sphere_dist_deg, x_scan_distance, DistType, Point, Rect};
use crate::hash::GeoHash;
use crate::index::Geo2dIndex;
use crate::storage::{
    Direction, DocStore, GeoPoint, IndexKey, KeyNode, KeyTree, Matcher, TreeCursor,
};

/// Ordered holder of the best candidates seen so far.
///
/// A candidate survives the approximate screen when its hash distance
/// could still beat the current farthest point after allowing for
/// quantization error on both sides.
pub struct Hopper {
    pub acc: Accumulator,
    matcher: Option<Box<dyn Matcher>>,
    max: usize,
    near: Point,
    max_distance: f64,
    dist_type: DistType,
    dist_error: f64,
    farthest: f64,
    points: Vec<GeoPoint>,
}

impl Hopper {
    pub fn new(
        index: &Geo2dIndex,
        max: usize,
        near: Point,
        matcher: Option<Box<dyn Matcher>>,
        max_distance: f64,
        dist_type: DistType,
    ) -> Self {
        let dist_error = match dist_type {
            DistType::Plain => index.error(),
            DistType::Sphere => index.error_sphere(),
        };
        Hopper {
            acc: Accumulator::new(),
            matcher,
            max,
            near,
            max_distance,
            dist_type,
            dist_error,
            farthest: 0.0,
            points: Vec::new(),
        }
    }

    /// Accepted keys so far (not necessarily retained points).
    pub fn found(&self) -> u64 {
        self.acc.found
    }

    /// Exact distance of the current worst retained point.
    pub fn farthest(&self) -> f64 {
        self.farthest
    }

    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn into_points(self) -> Vec<GeoPoint> {
        self.points
    }

    fn approx_distance(&self, index: &Geo2dIndex, h: &GeoHash) -> f64 {
        match self.dist_type {
            DistType::Plain => self.near.distance(&index.point(h)),
            DistType::Sphere => sphere_dist_deg(&self.near, &index.point(h)),
        }
    }

    fn check_distance(&self, index: &Geo2dIndex, node: &KeyNode) -> Option<f64> {
        let d = self.approx_distance(index, &node.key.hash);
        let good = d <= self.max_distance + 2.0 * self.dist_error
            && (self.points.len() < self.max || d <= self.farthest + 2.0 * self.dist_error);
        good.then_some(d)
    }

    /// Runs one key through dedup, approximate distance, residual
    /// predicate, and exact insertion.
    pub fn add(&mut self, node: KeyNode, index: &Geo2dIndex, store: &dyn DocStore) {
        if !self.acc.observe(&node) {
            return;
        }
        let Some(_approx) = self.check_distance(index, &node) else {
            return;
        };
        let new_doc = match self.acc.residual(&node, self.matcher.as_deref(), store) {
            Screen::Drop => return,
            Screen::Keep { new_doc } => new_doc,
        };
        if new_doc {
            self.insert_exact(node, index, store);
        }
        self.acc.found += 1;
    }

    /// Re-measures a document against all of its raw locations and
    /// retains it under the smallest in-bound exact distance.
    fn insert_exact(&mut self, node: KeyNode, index: &Geo2dIndex, store: &dyn DocStore) {
        let Some(doc) = store.document(node.loc).cloned() else {
            return;
        };

        let mut best: Option<f64> = None;
        for loc in index.locations(&doc).unwrap_or_default() {
            let Ok(p) = Point::from_value(loc) else {
                // Exact re-check failures are silent drops.
                continue;
            };
            let (exact, within) = match self.dist_type {
                DistType::Plain => (
                    self.near.distance(&p),
                    self.near.distance_within(&p, self.max_distance),
                ),
                DistType::Sphere => {
                    let d = sphere_dist_deg(&self.near, &p);
                    (d, d <= self.max_distance)
                }
            };
            if !within {
                continue;
            }
            if best.map_or(true, |b| exact < b) {
                best = Some(exact);
            }
        }

        let Some(best) = best else { return };

        // Stable on ties: equal distances keep insertion order.
        let at = self
            .points
            .partition_point(|p| OrderedFloat(p.exact_distance) <= OrderedFloat(best));
        self.points.insert(
            at,
            GeoPoint {
                key: node.key,
                loc: node.loc,
                doc,
                exact_distance: best,
                exact_within: true,
            },
        );

        while self.points.len() > self.max {
            self.points.pop();
        }
        if let Some(last) = self.points.last() {
            self.farthest = last.exact_distance;
        }
    }
}

/// The two-phase nearest-neighbor expansion.
pub struct NearSearch<'a> {
    index: &'a Geo2dIndex,
    tree: &'a dyn KeyTree,
    store: &'a dyn DocStore,
    start_pt: Point,
    start: GeoHash,
    prefix: GeoHash,
    num_wanted: usize,
    dist_type: DistType,
    scan_distance: f64,
    pub hopper: Hopper,
    nscanned: u64,
    already_scanned: Option<Rect>,
}

impl std::fmt::Debug for NearSearch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearSearch").finish_non_exhaustive()
    }
}

impl<'a> NearSearch<'a> {
    pub fn new(
        index: &'a Geo2dIndex,
        tree: &'a dyn KeyTree,
        store: &'a dyn DocStore,
        start_pt: Point,
        num_wanted: usize,
        matcher: Option<Box<dyn Matcher>>,
        max_distance: f64,
        dist_type: DistType,
    ) -> Result<Self> {
        let start = index.hash_point(&start_pt)?;

        let scan_distance = match dist_type {
            DistType::Plain => max_distance + index.error(),
            DistType::Sphere => {
                if max_distance == f64::MAX {
                    max_distance
                } else {
                    x_scan_distance(start_pt.y, max_distance.to_degrees() + index.error())
                }
            }
        };

        let hopper = Hopper::new(index, num_wanted, start_pt, matcher, max_distance, dist_type);

        Ok(NearSearch {
            index,
            tree,
            store,
            start_pt,
            start,
            prefix: start,
            num_wanted,
            dist_type,
            scan_distance,
            hopper,
            nscanned: 0,
            already_scanned: None,
        })
    }

    /// Overrides the expansion's starting hash (diagnostic hook).
    pub fn set_start(&mut self, start: GeoHash) {
        self.start = start;
        self.prefix = start;
    }

    pub fn nscanned(&self) -> u64 {
        self.nscanned
    }

    /// Runs the search to completion.
    pub fn exec(&mut self) -> Result<()> {
        self.prefix = self.start;
        let start_key = IndexKey::prefix(self.start);
        let mut min = TreeCursor::locate(self.tree, &start_key, Direction::Reverse);
        let mut max = TreeCursor::locate(self.tree, &start_key, Direction::Forward);

        if min.is_null() && max.is_null() {
            return Ok(());
        }

        // Phase 1: prefix descent toward the root.
        loop {
            if self.prefix.constrains()
                && !(self.hopper.found() < self.num_wanted as u64
                    && self.index.size_edge(&self.prefix) <= self.scan_distance)
            {
                break;
            }

            debug!(prefix = %self.prefix, found = self.hopper.found(), "near: expanding prefix");
            self.drain(&mut min, Direction::Reverse, true);
            self.drain(&mut max, Direction::Forward, true);

            if !self.prefix.constrains() {
                // The root prefix already covered the whole index.
                return Ok(());
            }
            self.already_scanned = Some(self.index.cell_rect(&self.prefix));
            self.prefix = self.prefix.parent();
        }

        // Phase 2: bounding-box completion around the farthest point.
        let mut farthest = self.hopper.farthest();
        if self.hopper.found() < self.num_wanted as u64 {
            farthest = self.scan_distance;
        } else if self.dist_type == DistType::Plain {
            farthest += self.index.error();
        } else {
            farthest = f64::min(
                self.scan_distance,
                x_scan_distance(self.start_pt.y, farthest.to_degrees())
                    + 2.0 * self.index.error(),
            );
        }

        let want = Rect::square(
            self.start_pt.x - farthest,
            self.start_pt.y - farthest,
            farthest * 2.0,
        );

        self.prefix = self.start;
        while self.prefix.constrains() && self.index.size_edge(&self.prefix) < farthest {
            self.prefix = self.prefix.parent();
        }

        if self.prefix.bits() <= 1 {
            // Covering prefix too coarse to bound the scan: walk out
            // the rest of the index from where phase 1 stopped.
            self.drain(&mut min, Direction::Reverse, false);
            self.drain(&mut max, Direction::Forward, false);
            return Ok(());
        }

        debug!(
            want = %want,
            farthest,
            nscanned = self.nscanned,
            cell = %self.prefix,
            "near: scanning covering cell and neighbors"
        );

        for dx in -1..=1 {
            for dy in -1..=1 {
                let toscan = self.prefix.shifted(dx, dy);
                self.do_box(&want, toscan, 0);
            }
        }

        Ok(())
    }

    /// Feeds keys to the hopper until the cursor leaves `self.prefix`
    /// (or, with `use_prefix` off, until the index ends).
    fn drain(&mut self, cur: &mut TreeCursor<'a>, direction: Direction, use_prefix: bool) {
        loop {
            let Some(node) = cur.node() else { return };
            if use_prefix && !node.key.hash.has_prefix(&self.prefix) {
                return;
            }
            self.hopper.add(node, self.index, self.store);
            self.nscanned += 1;
            if !cur.advance(direction) {
                return;
            }
        }
    }

    /// Scans one candidate cell of the phase-2 box sweep.
    fn do_box(&mut self, want: &Rect, toscan: GeoHash, depth: u32) {
        let test_rect = self.index.cell_rect(&toscan);

        if let Some(already) = &self.already_scanned {
            if already.area() > 0.0 && already.contains_rect(&test_rect, 0.0) {
                return;
            }
        }

        let overlap = test_rect.intersects_fraction(want);
        if overlap <= 0.0 {
            return;
        }
        // Heuristic: cells with little overlap and shallow depth are
        // split into quadrants rather than walked whole.
        let go_deeper = overlap < 0.5 && depth < 2;

        let mut my_scanned = 0u64;
        let mut cur = TreeCursor::locate(self.tree, &IndexKey::prefix(toscan), Direction::Forward);
        if let Some(node) = cur.node() {
            self.hopper.add(node, self.index, self.store);
        }
        loop {
            if !cur.has_prefix(&toscan) {
                return;
            }
            if !cur.advance(Direction::Forward) {
                return;
            }
            if let Some(node) = cur.node() {
                self.hopper.add(node, self.index, self.store);
            }
            self.nscanned += 1;
            my_scanned += 1;
            if my_scanned > 100 && go_deeper {
                for q in 0..4u8 {
                    self.do_box(want, toscan.append(&GeoHash::quadrant(q)), depth + 1);
                }
                return;
            }
        }
    }
}
