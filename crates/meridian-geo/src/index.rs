//! The 2-D index descriptor: quantization parameters, key extraction,
//! and hash-space distances.

use meridian_common::document::{fields_dotted, fields_dotted_expanded, values_of};
use meridian_common::{GeoIndexOptions, MeridianError, Result};
use serde_json::Value;

use crate::geometry::{Point, Rect};
use crate::hash::GeoHash;
use crate::storage::IndexKey;

/// Number of quantization buckets per axis (2^32).
const NUM_BUCKETS: f64 = 1024.0 * 1024.0 * 1024.0 * 4.0;

/// Descriptor of one 2-D geo index.
///
/// Immutable once opened. The geo field is always the leading key
/// component; any `other_fields` are projected into the key after it.
#[derive(Debug, Clone)]
pub struct Geo2dIndex {
    geo_field: String,
    other_fields: Vec<String>,
    bits: u32,
    min: f64,
    max: f64,
    scaling: f64,
    error: f64,
    error_sphere: f64,
}

impl Geo2dIndex {
    pub fn new(
        geo_field: impl Into<String>,
        other_fields: Vec<String>,
        options: GeoIndexOptions,
    ) -> Result<Self> {
        options.validate()?;

        let mut index = Geo2dIndex {
            geo_field: geo_field.into(),
            other_fields,
            bits: options.bits,
            min: options.min,
            max: options.max,
            scaling: NUM_BUCKETS / (options.max - options.min),
            error: 0.0,
            error_sphere: 0.0,
        };
        if index.geo_field.is_empty() {
            return Err(MeridianError::InvalidIndexConfig(
                "no geo field specified".to_string(),
            ));
        }

        // One diagonal cell step at full precision bounds the
        // quantization error of any hashed point.
        let a = GeoHash::from_quantized(0, 0, index.bits);
        let b = a.shifted(1, 1);
        index.error = index.distance(&a, &b);
        index.error_sphere = index.error.to_radians();

        Ok(index)
    }

    pub fn geo_field(&self) -> &str {
        &self.geo_field
    }

    pub fn other_fields(&self) -> &[String] {
        &self.other_fields
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn domain_min(&self) -> f64 {
        self.min
    }

    pub fn domain_max(&self) -> f64 {
        self.max
    }

    /// Planar quantization error bound.
    pub fn error(&self) -> f64 {
        self.error
    }

    /// The same bound reinterpreted as radians for spherical checks.
    pub fn error_sphere(&self) -> f64 {
        self.error_sphere
    }

    fn quantize(&self, v: f64) -> Result<u32> {
        if !(v >= self.min && v < self.max) {
            return Err(MeridianError::PointOutOfRange {
                min: self.min,
                max: self.max,
            });
        }
        Ok(((v - self.min) * self.scaling) as u32)
    }

    fn unquantize(&self, q: u32) -> f64 {
        q as f64 / self.scaling + self.min
    }

    /// Hashes a coordinate pair at the index precision.
    pub fn hash(&self, x: f64, y: f64) -> Result<GeoHash> {
        Ok(GeoHash::from_quantized(
            self.quantize(x)?,
            self.quantize(y)?,
            self.bits,
        ))
    }

    pub fn hash_point(&self, p: &Point) -> Result<GeoHash> {
        self.hash(p.x, p.y)
    }

    /// Hashes a location sub-document.
    pub fn hash_value(&self, loc: &Value) -> Result<GeoHash> {
        self.hash_point(&Point::from_value(loc)?)
    }

    /// Hashes a location value or parses an explicit hash string.
    pub fn to_hash(&self, v: &Value) -> Result<GeoHash> {
        match v {
            Value::String(s) => s.parse(),
            _ => self.hash_value(v),
        }
    }

    /// Decodes a hash back to its cell's low corner.
    pub fn point(&self, h: &GeoHash) -> Point {
        let (qx, qy) = h.quantized();
        Point::new(self.unquantize(qx), self.unquantize(qy))
    }

    /// Distance between the decoded corners of two hashes.
    pub fn distance(&self, a: &GeoHash, b: &GeoHash) -> f64 {
        self.point(a).distance(&self.point(b))
    }

    /// Diagonal of the cell named by `h`.
    pub fn size_diag(&self, h: &GeoHash) -> f64 {
        self.distance(h, &h.shifted(1, 1))
    }

    /// Edge length of the cell named by `h`.
    pub fn size_edge(&self, h: &GeoHash) -> f64 {
        let a = self.point(h);
        let b = self.point(&h.shifted(1, 1));

        // The domain edge wraps to min and would read as a zero edge.
        let bx = if b.x == self.min { self.max } else { b.x };
        (a.x - bx).abs()
    }

    /// The square region a prefix names.
    pub fn cell_rect(&self, h: &GeoHash) -> Rect {
        let corner = self.point(h);
        Rect::square(corner.x, corner.y, self.size_edge(h))
    }

    /// Extracts the ordered set of index keys for a document.
    ///
    /// Location grammar at the geo field:
    /// `locs ::= [loc, ...] | {k: loc, ...} | loc` where
    /// `loc ::= {k1: #, k2: #} | [#, #] | {}`. Empty locations are
    /// skipped; a missing geo field indexes nothing. Multi-valued
    /// trailing fields are embedded as arrays, so such keys cannot
    /// serve equality seeks on those fields.
    pub fn get_keys(&self, doc: &Value) -> Result<Vec<IndexKey>> {
        let mut keys = Vec::new();

        self.for_each_location(doc, |loc| {
            let hash = self.hash_value(loc)?;
            let trailing = self
                .other_fields
                .iter()
                .map(|field| {
                    let found = fields_dotted_expanded(doc, field);
                    match found.as_slice() {
                        [] => Value::Null,
                        [single] => (*single).clone(),
                        _ => Value::Array(found.into_iter().cloned().collect()),
                    }
                })
                .collect();
            keys.push(IndexKey { hash, trailing });
            Ok(())
        })?;

        keys.sort_by(|a, b| a.encode().cmp(&b.encode()));
        keys.dedup();
        Ok(keys)
    }

    /// Collects the raw location sub-documents of a document, in key
    /// extraction order. Used for exact re-checks.
    pub fn locations<'a>(&self, doc: &'a Value) -> Result<Vec<&'a Value>> {
        let mut locs = Vec::new();
        self.for_each_location(doc, |loc| {
            locs.push(loc);
            Ok(())
        })?;
        Ok(locs)
    }

    fn for_each_location<'a>(
        &self,
        doc: &'a Value,
        mut f: impl FnMut(&'a Value) -> Result<()>,
    ) -> Result<()> {
        for geo in fields_dotted(doc, &self.geo_field) {
            if !(geo.is_object() || geo.is_array()) {
                continue;
            }
            let members = values_of(geo);
            if members.is_empty() {
                continue;
            }

            // A leading number means this is a single location, not a
            // container of locations.
            if members[0].is_number() {
                f(geo)?;
                continue;
            }

            for member in members {
                if !(member.is_object() || member.is_array()) {
                    return Err(MeridianError::InvalidGeometry(
                        "location object expected, location array not in correct format"
                            .to_string(),
                    ));
                }
                if values_of(member).is_empty() {
                    continue;
                }
                f(member)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::GeoIndexOptions;
    use serde_json::json;

    fn default_index() -> Geo2dIndex {
        Geo2dIndex::new("loc", vec![], GeoIndexOptions::default()).unwrap()
    }

    fn round3(v: f64) -> i64 {
        (0.5 + v * 1000.0) as i64
    }

    #[test]
    fn test_hash_roundtrip() {
        let g = default_index();
        let x = 73.01212;
        let y = 41.352964;
        let h = g.hash(x, y).unwrap();
        assert_eq!(h.bits(), 26);
        let out = g.point(&h);
        assert_eq!(round3(x), round3(out.x));
        assert_eq!(round3(y), round3(out.y));
    }

    #[test]
    fn test_hash_roundtrip_negative() {
        let g = default_index();
        let x = -73.01212;
        let y = 41.352964;
        let out = g.point(&g.hash(x, y).unwrap());
        assert_eq!(round3(x), round3(out.x));
        assert_eq!(round3(y), round3(out.y));
    }

    #[test]
    fn test_out_of_domain_is_user_error() {
        let g = default_index();
        let err = g.hash(180.0, 0.0).unwrap_err();
        assert!(err.is_user_error());
        assert!(g.hash(-180.0, 0.0).is_ok());
        assert!(g.hash(0.0, 181.0).is_err());
    }

    #[test]
    fn test_distance() {
        let g = default_index();
        let a = g.hash(1.0, 1.0).unwrap();
        let b = g.hash(4.0, 5.0).unwrap();
        assert!((g.distance(&a, &b) - 5.0).abs() < 0.01);

        let a = g.hash(50.0, 50.0).unwrap();
        let b = g.hash(42.0, 44.0).unwrap();
        assert_eq!(round3(10.0), round3(g.distance(&a, &b)));

        let a = g.hash(50.0, 50.0).unwrap();
        let b = g.hash(48.0, 54.0).unwrap();
        assert_eq!(round3(4.47214), round3(g.distance(&a, &b)));
    }

    #[test]
    fn test_hash_ordering_follows_coordinates() {
        let g = default_index();
        let a = g.hash(5.0, 5.0).unwrap();
        let b = g.hash(5.0, 7.0).unwrap();
        let c = g.hash(100.0, 100.0).unwrap();
        assert!(a < b);
        assert!(a < c);
    }

    #[test]
    fn test_error_is_one_diagonal_cell() {
        let g = default_index();
        let h = g.hash(0.0, 0.0).unwrap();
        assert!((g.error() - g.size_diag(&h)).abs() < 1e-12);
        assert!((g.error_sphere() - g.error().to_radians()).abs() < 1e-18);
    }

    #[test]
    fn test_size_edge_matches_precision() {
        let g = default_index();
        let h = g.hash(0.0, 0.0).unwrap();
        let expected = 360.0 / (1u64 << 26) as f64;
        assert!((g.size_edge(&h) - expected).abs() < 1e-9);
        // Parent cells double the edge.
        assert!((g.size_edge(&h.parent()) - 2.0 * expected).abs() < 1e-9);
    }

    #[test]
    fn test_get_keys_single_location() {
        let g = default_index();
        let keys = g.get_keys(&json!({"loc": [1.0, 2.0]})).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].hash, g.hash(1.0, 2.0).unwrap());
    }

    #[test]
    fn test_get_keys_location_array() {
        let g = default_index();
        let doc = json!({"loc": [[1.0, 2.0], [3.0, 4.0]]});
        let keys = g.get_keys(&doc).unwrap();
        assert_eq!(keys.len(), 2);

        let locs = g.locations(&doc).unwrap();
        assert_eq!(locs.len(), 2);
    }

    #[test]
    fn test_get_keys_named_locations() {
        let g = default_index();
        let doc = json!({"loc": {"home": [1.0, 2.0], "work": {"x": 3.0, "y": 4.0}}});
        let keys = g.get_keys(&doc).unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_get_keys_skips_empty_locations() {
        let g = default_index();
        let keys = g.get_keys(&json!({"loc": [[1.0, 2.0], {}]})).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(g.get_keys(&json!({"loc": {}})).unwrap().is_empty());
    }

    #[test]
    fn test_get_keys_missing_field_is_not_an_error() {
        let g = default_index();
        assert!(g.get_keys(&json!({"name": "x"})).unwrap().is_empty());
    }

    #[test]
    fn test_get_keys_bad_location_member() {
        let g = default_index();
        let err = g.get_keys(&json!({"loc": [[1.0, 2.0], "oops"]})).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_get_keys_non_numeric_coordinates() {
        let g = default_index();
        assert!(g.get_keys(&json!({"loc": ["a", "b"]})).is_err());
    }

    #[test]
    fn test_get_keys_trailing_fields() {
        let g = Geo2dIndex::new(
            "loc",
            vec!["category".to_string()],
            GeoIndexOptions::default(),
        )
        .unwrap();

        let keys = g
            .get_keys(&json!({"loc": [1.0, 2.0], "category": "cafe"}))
            .unwrap();
        assert_eq!(keys[0].trailing, vec![json!("cafe")]);

        // Missing trailing field projects as null.
        let keys = g.get_keys(&json!({"loc": [1.0, 2.0]})).unwrap();
        assert_eq!(keys[0].trailing, vec![Value::Null]);

        // Multi-valued trailing fields embed as an array.
        let keys = g
            .get_keys(&json!({"loc": [1.0, 2.0], "category": ["cafe", "bar"]}))
            .unwrap();
        assert_eq!(keys[0].trailing[0], json!(["cafe", "bar"]));
    }

    #[test]
    fn test_get_keys_dedups() {
        let g = default_index();
        let keys = g
            .get_keys(&json!({"loc": [[1.0, 2.0], [1.0, 2.0]]}))
            .unwrap();
        assert_eq!(keys.len(), 1);
    }
}
