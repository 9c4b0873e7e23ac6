//! Planar and spherical geometry primitives.

use std::cell::OnceCell;
use std::f64::consts::PI;
use std::fmt;

use meridian_common::document::{as_number, values_of};
use meridian_common::{MeridianError, Result};
use serde_json::Value;

pub const EARTH_RADIUS_KM: f64 = 6371.0;
pub const EARTH_RADIUS_MILES: f64 = EARTH_RADIUS_KM * 0.621371192;

/// Distance metric selector for near/circle queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistType {
    Plain,
    Sphere,
}

/// A point in the index's coordinate domain.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    /// Reads a location value: `{k1: x, k2: y}` or `[x, y]`.
    ///
    /// The first two values must both be numeric; trailing fields are
    /// ignored.
    pub fn from_value(loc: &Value) -> Result<Point> {
        let vals = values_of(loc);
        let mut it = vals.iter();
        let x = it
            .next()
            .ok_or_else(|| MeridianError::InvalidGeometry("geo field is empty".to_string()))?;
        let y = it.next().ok_or_else(|| {
            MeridianError::InvalidGeometry("geo field only has 1 element".to_string())
        })?;
        match (as_number(x), as_number(y)) {
            (Some(x), Some(y)) => Ok(Point { x, y }),
            _ => Err(MeridianError::InvalidGeometry(format!(
                "geo values have to be numbers: {}",
                loc
            ))),
        }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Avoids the square root when only a threshold test is needed.
    pub fn distance_within(&self, other: &Point, max_distance: f64) -> bool {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy <= max_distance * max_distance
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Central angle between two points given in radians.
///
/// Computed from the dot product of the unit vectors, clamped so equal
/// points give exactly 0 and antipodes exactly pi with no NaN.
pub fn sphere_dist_rad(p1: &Point, p2: &Point) -> f64 {
    let (sin_x1, cos_x1) = p1.x.sin_cos();
    let (sin_y1, cos_y1) = p1.y.sin_cos();
    let (sin_x2, cos_x2) = p2.x.sin_cos();
    let (sin_y2, cos_y2) = p2.y.sin_cos();

    let cross = (cos_y1 * cos_x1 * cos_y2 * cos_x2)
        + (cos_y1 * sin_x1 * cos_y2 * sin_x2)
        + (sin_y1 * sin_y2);

    if cross >= 1.0 {
        0.0
    } else if cross <= -1.0 {
        PI
    } else {
        cross.acos()
    }
}

/// Central angle between two points given in degrees.
pub fn sphere_dist_deg(p1: &Point, p2: &Point) -> f64 {
    sphere_dist_rad(
        &Point::new(p1.x.to_radians(), p1.y.to_radians()),
        &Point::new(p2.x.to_radians(), p2.y.to_radians()),
    )
}

/// Widens a y-axis scan distance into the x-axis distance needed at
/// latitude `y`, using the worse of the two cosines across the band.
/// Latitudes are clamped to +/-89 degrees to keep the division sane.
pub fn x_scan_distance(y: f64, max_dist_degrees: f64) -> f64 {
    max_dist_degrees
        / f64::min(
            (89.0f64.min(y + max_dist_degrees)).to_radians().cos(),
            ((-89.0f64).max(y - max_dist_degrees)).to_radians().cos(),
        )
}

/// An axis-aligned box.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub min: Point,
    pub max: Point,
}

impl Rect {
    pub fn new(min: Point, max: Point) -> Self {
        Rect { min, max }
    }

    /// A square with its low corner at (x, y).
    pub fn square(x: f64, y: f64, size: f64) -> Self {
        Rect {
            min: Point::new(x, y),
            max: Point::new(x + size, y + size),
        }
    }

    fn between(min: f64, max: f64, val: f64, fudge: f64) -> bool {
        val + fudge >= min && val <= max + fudge
    }

    fn bound_hit(bound: f64, val: f64, fudge: f64) -> bool {
        val >= bound - fudge && val <= bound + fudge
    }

    /// Overlap of [amin, amax] and [bmin, bmax]: the lower bound of the
    /// intersection when `want_min`, the upper otherwise. None when the
    /// intervals are disjoint.
    fn mid(amin: f64, amax: f64, bmin: f64, bmax: f64, want_min: bool) -> Option<f64> {
        debug_assert!(amin <= amax);
        debug_assert!(bmin <= bmax);

        if amin < bmin {
            if amax < bmin {
                return None;
            }
            return Some(if want_min { bmin } else { amax });
        }
        if amin > bmax {
            return None;
        }
        Some(if want_min { amin } else { bmax })
    }

    /// Intersection area over the average of the two areas, in [0, 1].
    /// Zero means no overlap.
    pub fn intersects_fraction(&self, other: &Rect) -> f64 {
        let bound_min_x = Rect::mid(self.min.x, self.max.x, other.min.x, other.max.x, true);
        let bound_max_x = Rect::mid(self.min.x, self.max.x, other.min.x, other.max.x, false);
        let bound_min_y = Rect::mid(self.min.y, self.max.y, other.min.y, other.max.y, true);
        let bound_max_y = Rect::mid(self.min.y, self.max.y, other.min.y, other.max.y, false);

        let (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) =
            (bound_min_x, bound_max_x, bound_min_y, bound_max_y)
        else {
            return 0.0;
        };

        let intersection = Rect::new(Point::new(min_x, min_y), Point::new(max_x, max_y));
        intersection.area() / ((self.area() + other.area()) / 2.0)
    }

    pub fn area(&self) -> f64 {
        (self.max.x - self.min.x) * (self.max.y - self.min.y)
    }

    pub fn max_dim(&self) -> f64 {
        f64::max(self.max.x - self.min.x, self.max.y - self.min.y)
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
        )
    }

    pub fn on_boundary(&self, p: &Point, fudge: f64) -> bool {
        Rect::bound_hit(self.min.x, p.x, fudge)
            || Rect::bound_hit(self.max.x, p.x, fudge)
            || Rect::bound_hit(self.min.y, p.y, fudge)
            || Rect::bound_hit(self.max.y, p.y, fudge)
    }

    pub fn inside(&self, p: &Point, fudge: f64) -> bool {
        self.inside_xy(p.x, p.y, fudge)
    }

    pub fn inside_xy(&self, x: f64, y: f64, fudge: f64) -> bool {
        Rect::between(self.min.x, self.max.x, x, fudge)
            && Rect::between(self.min.y, self.max.y, y, fudge)
    }

    pub fn contains_rect(&self, other: &Rect, fudge: f64) -> bool {
        self.inside(&other.min, fudge) && self.inside(&other.max, fudge)
    }

    /// Grows the box to cover `p`.
    pub fn extend(&mut self, p: Point) {
        if p.x < self.min.x {
            self.min.x = p.x;
        } else if p.x > self.max.x {
            self.max.x = p.x;
        }
        if p.y < self.min.y {
            self.min.y = p.y;
        } else if p.y > self.max.y {
            self.max.y = p.y;
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -->> {}", self.min, self.max)
    }
}

/// A closed polygon over at least three points.
#[derive(Debug, Clone)]
pub struct Polygon {
    points: Vec<Point>,
    centroid: OnceCell<Point>,
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> Self {
        Polygon {
            points,
            centroid: OnceCell::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Exact containment test (no error band).
    pub fn contains(&self, p: &Point) -> bool {
        self.contains_fudge(p, 0.0) > 0
    }

    /// Ray-casting containment with an error band.
    ///
    /// Returns +1 inside, -1 outside, or 0 when any segment passes
    /// within `fudge` of `p`, in which case the caller must re-check
    /// with exact coordinates.
    pub fn contains_fudge(&self, p: &Point, fudge: f64) -> i32 {
        let fudge_box = Rect::new(
            Point::new(p.x - fudge, p.y - fudge),
            Point::new(p.x + fudge, p.y + fudge),
        );

        let n = self.points.len();
        let mut counter = 0u32;
        let mut p1 = self.points[0];
        for i in 1..=n {
            let p2 = self.points[i % n];

            // Segment near the error box? The approximate verdict cannot
            // be trusted then.
            if fudge > 0.0
                && fudge_box.min.y <= f64::max(p1.y, p2.y)
                && fudge_box.max.y >= f64::min(p1.y, p2.y)
                && fudge_box.min.x <= f64::max(p1.x, p2.x)
                && fudge_box.max.x >= f64::min(p1.x, p2.x)
            {
                if fudge_box.inside(&p1, 0.0) || fudge_box.inside(&p2, 0.0) {
                    return 0;
                }

                // Where the segment crosses the box's horizontal edges.
                if p1.y != p2.y {
                    let inv_slope = (p2.x - p1.x) / (p2.y - p1.y);

                    let x_top = (fudge_box.max.y - p1.y) * inv_slope + p1.x;
                    if fudge_box.min.x <= x_top && fudge_box.max.x >= x_top {
                        return 0;
                    }

                    let x_bottom = (fudge_box.min.y - p1.y) * inv_slope + p1.x;
                    if fudge_box.min.x <= x_bottom && fudge_box.max.x >= x_bottom {
                        return 0;
                    }
                }

                // And the vertical edges.
                if p1.x != p2.x {
                    let slope = (p2.y - p1.y) / (p2.x - p1.x);

                    let y_right = (p1.x - fudge_box.max.x) * slope + p1.y;
                    if fudge_box.min.y <= y_right && fudge_box.max.y >= y_right {
                        return 0;
                    }

                    let y_left = (p1.x - fudge_box.min.x) * slope + p1.y;
                    if fudge_box.min.y <= y_left && fudge_box.max.y >= y_left {
                        return 0;
                    }
                }
            }

            // Standard ray cast toward +x.
            if p.y > f64::min(p1.y, p2.y)
                && p.y <= f64::max(p1.y, p2.y)
                && p.x <= f64::max(p1.x, p2.x)
                && p1.y != p2.y
            {
                let x_inters = (p.y - p1.y) * (p2.x - p1.x) / (p2.y - p1.y) + p1.x;
                if p1.x == p2.x || p.x <= x_inters {
                    counter += 1;
                }
            }

            p1 = p2;
        }

        if counter % 2 == 0 {
            -1
        } else {
            1
        }
    }

    /// Center of mass by the signed-area formula. Cached after the
    /// first call.
    pub fn centroid(&self) -> Point {
        *self.centroid.get_or_init(|| {
            let pts = &self.points;
            let n = pts.len();
            let mut cx = 0.0;
            let mut cy = 0.0;
            let mut signed_area = 0.0;

            for i in 0..n {
                let j = (i + 1) % n;
                let a = pts[i].x * pts[j].y - pts[j].x * pts[i].y;
                signed_area += a;
                cx += (pts[i].x + pts[j].x) * a;
                cy += (pts[i].y + pts[j].y) * a;
            }

            signed_area *= 0.5;
            Point::new(cx / (6.0 * signed_area), cy / (6.0 * signed_area))
        })
    }

    /// Axis-aligned bounding box of the vertices.
    pub fn bounds(&self) -> Rect {
        let mut bounds = Rect::new(self.points[0], self.points[0]);
        for p in &self.points[1..] {
            bounds.min.x = bounds.min.x.min(p.x);
            bounds.min.y = bounds.min.y.min(p.y);
            bounds.max.x = bounds.max.x.max(p.x);
            bounds.max.y = bounds.max.y.max(p.y);
        }
        bounds
    }
}
