//! Geohash 2-D index core for Meridian.
//!
//! This crate provides:
//! - Interleaved-bit geohash keys with prefix arithmetic
//! - Planar and spherical geometry primitives
//! - The index descriptor: quantization, key extraction, planning
//! - Nearest-neighbor search by prefix expansion
//! - Box/circle/polygon region scans with exact re-checking
//! - The geoNear, geoCluster, and geoWalk commands

pub mod accumulator;
pub mod browse;
pub mod commands;
pub mod cursor;
pub mod geometry;
pub mod hash;
pub mod index;
pub mod near;
pub mod plan;
pub mod storage;

pub use browse::{RegionBrowse, RegionShape};
pub use commands::{geo_cluster, geo_near, geo_walk};
pub use cursor::{GeoCursor, NearCursor};
pub use geometry::{
    sphere_dist_deg, sphere_dist_rad, DistType, Point, Polygon, Rect, EARTH_RADIUS_KM,
    EARTH_RADIUS_MILES,
};
pub use hash::GeoHash;
pub use index::Geo2dIndex;
pub use near::{Hopper, NearSearch};
pub use plan::{new_cursor, suitability, Suitability};
pub use storage::{
    Direction, DocRef, DocStore, GeoPoint, IndexKey, KeyNode, KeyTree, MatchOutcome, Matcher,
    MemCollection, QueryMatcher, TreePos,
};
