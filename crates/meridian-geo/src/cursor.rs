//! The cursor surface handed back to the query layer.

use crate::browse::RegionBrowse;
use crate::storage::GeoPoint;

/// Iterates the buffered results of a finished near search.
pub struct NearCursor {
    points: Vec<GeoPoint>,
    at: usize,
    nscanned: u64,
    btreelocs: u64,
}

impl NearCursor {
    pub fn new(points: Vec<GeoPoint>, btreelocs: u64) -> Self {
        let nscanned = if points.is_empty() { 0 } else { 1 };
        NearCursor {
            points,
            at: 0,
            nscanned,
            btreelocs,
        }
    }

    pub fn ok(&self) -> bool {
        self.at < self.points.len()
    }

    pub fn advance(&mut self) -> bool {
        self.at += 1;
        if self.ok() {
            self.nscanned += 1;
        }
        self.ok()
    }

    pub fn current(&self) -> Option<&GeoPoint> {
        self.points.get(self.at)
    }

    pub fn nscanned(&self) -> u64 {
        self.nscanned
    }

    /// B-tree positions touched while the search executed.
    pub fn btreelocs(&self) -> u64 {
        self.btreelocs
    }
}

/// A geo query cursor: either buffered near results or a live region
/// browse.
pub enum GeoCursor<'a> {
    Near(NearCursor),
    Browse(RegionBrowse<'a>),
}

impl std::fmt::Debug for GeoCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeoCursor::Near(_) => f.debug_tuple("Near").finish(),
            GeoCursor::Browse(_) => f.debug_tuple("Browse").finish(),
        }
    }
}

impl GeoCursor<'_> {
    pub fn ok(&mut self) -> bool {
        match self {
            GeoCursor::Near(c) => c.ok(),
            GeoCursor::Browse(b) => b.ok(),
        }
    }

    pub fn advance(&mut self) -> bool {
        match self {
            GeoCursor::Near(c) => c.advance(),
            GeoCursor::Browse(b) => b.advance(),
        }
    }

    pub fn current(&self) -> Option<&GeoPoint> {
        match self {
            GeoCursor::Near(c) => c.current(),
            GeoCursor::Browse(b) => b.current(),
        }
    }

    pub fn nscanned(&self) -> u64 {
        match self {
            GeoCursor::Near(c) => c.nscanned(),
            GeoCursor::Browse(b) => b.nscanned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::GeoHash;
    use crate::storage::{DocRef, GeoPoint, IndexKey, KeyNode};
    use serde_json::json;

    fn point(id: u64, dist: f64) -> GeoPoint {
        let node = KeyNode {
            key: IndexKey::prefix(GeoHash::from_quantized(id as u32, 0, 32)),
            loc: DocRef(id),
        };
        GeoPoint {
            exact_distance: dist,
            exact_within: true,
            ..GeoPoint::unmeasured(node, json!({"_id": id}))
        }
    }

    #[test]
    fn test_near_cursor_iteration() {
        let mut c = NearCursor::new(vec![point(0, 1.0), point(1, 2.0)], 5);
        assert!(c.ok());
        assert_eq!(c.current().unwrap().doc["_id"], json!(0));
        assert!(c.advance());
        assert_eq!(c.current().unwrap().doc["_id"], json!(1));
        assert!(!c.advance());
        assert!(!c.ok());
        assert!(c.current().is_none());
        assert_eq!(c.nscanned(), 2);
        assert_eq!(c.btreelocs(), 5);
    }

    #[test]
    fn test_near_cursor_empty() {
        let c = NearCursor::new(vec![], 0);
        assert!(!c.ok());
        assert!(c.current().is_none());
        assert_eq!(c.nscanned(), 0);
    }
}
