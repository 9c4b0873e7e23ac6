//! Query planning: suitability scoring and cursor construction.

use meridian_common::document::{as_number, values_of};
use meridian_common::{MeridianError, Result};
use serde_json::Value;

use crate::browse::{RegionBrowse, RegionShape};
use crate::cursor::{GeoCursor, NearCursor};
use crate::geometry::{DistType, Point};
use crate::index::Geo2dIndex;
use crate::near::NearSearch;
use crate::storage::{DocStore, KeyTree, Matcher, QueryMatcher};

/// How well this index serves a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suitability {
    Optimal,
    Helpful,
    Useless,
}

fn is_geo_operator(key: &str) -> bool {
    key.starts_with("$near") || key == "$within"
}

/// Scores the query's predicate on the index's geo field.
///
/// `$near`/`$within` shapes are what the index exists for. A plain
/// equality against an array or object can still use the index, but
/// only when the query carries no other terms: non-geo key data is
/// stored in a non-standard way and cannot serve residual lookups.
pub fn suitability(index: &Geo2dIndex, query: &Value) -> Suitability {
    let Some(clause) = query.get(index.geo_field()) else {
        return Suitability::Useless;
    };

    match clause {
        Value::Object(map) => {
            if map.keys().any(|k| is_geo_operator(k)) {
                return Suitability::Optimal;
            }
            equality_suitability(query)
        }
        Value::Array(_) => equality_suitability(query),
        _ => Suitability::Useless,
    }
}

fn equality_suitability(query: &Value) -> Suitability {
    let fields = query.as_object().map_or(0, |m| m.len());
    if fields > 1 {
        Suitability::Useless
    } else {
        Suitability::Helpful
    }
}

/// Builds the cursor for a geo query.
///
/// `num_wanted` follows the query protocol: negative means a hard
/// limit by absolute value, zero means the default batch of 100.
pub fn new_cursor<'a>(
    index: &'a Geo2dIndex,
    tree: &'a dyn KeyTree,
    store: &'a dyn DocStore,
    query: &Value,
    num_wanted: i64,
) -> Result<GeoCursor<'a>> {
    let num_wanted = match num_wanted {
        n if n < 0 => (-n) as usize,
        0 => 100,
        n => n as usize,
    };

    let missing = || {
        MeridianError::InvalidQuery(format!(
            "missing geo field ({}) in : {}",
            index.geo_field(),
            query
        ))
    };

    let clause = query.get(index.geo_field()).ok_or_else(missing)?;
    let map = clause.as_object().ok_or_else(missing)?;

    // $near / $nearSphere
    if let Some((op, spec)) = map.iter().find(|(k, _)| k.starts_with("$near")) {
        let dist_type = match &op[5..] {
            "" => DistType::Plain,
            "Sphere" => DistType::Sphere,
            _ => {
                return Err(MeridianError::InvalidQuery(format!(
                    "invalid $near search type: {}",
                    op
                )))
            }
        };

        let origin = Point::from_value(spec)?;

        // A third tuple element is a distance bound; an explicit
        // $maxDistance wins over it.
        let mut max_distance = f64::MAX;
        let vals = values_of(spec);
        if vals.len() > 2 {
            if let Some(d) = as_number(vals[2]) {
                max_distance = d;
            }
        }
        if let Some(d) = map.get("$maxDistance").and_then(as_number) {
            max_distance = d;
        }

        let mut search = NearSearch::new(
            index,
            tree,
            store,
            origin,
            num_wanted,
            residual_matcher(query, index),
            max_distance,
            dist_type,
        )?;
        search.exec()?;

        let btreelocs = search.nscanned();
        return Ok(GeoCursor::Near(NearCursor::new(
            search.hopper.into_points(),
            btreelocs,
        )));
    }

    // $within
    if let Some(within) = map.get("$within") {
        let shapes = within.as_object().ok_or_else(|| {
            MeridianError::InvalidQuery("$within has to take an object or array".to_string())
        })?;

        let shape = if let Some(spec) = shapes.get("$center") {
            let (center, radius) = parse_center(spec, "$center")?;
            RegionShape::circle(index, center, radius)?
        } else if let Some(spec) = shapes.get("$centerSphere") {
            let (center, radius) = parse_center(spec, "$centerSphere")?;
            RegionShape::circle_sphere(index, center, radius)?
        } else if let Some(spec) = shapes.get("$box") {
            let vals = values_of(spec);
            if vals.len() != 2 {
                return Err(MeridianError::InvalidQuery(
                    "$box needs 2 fields (bottomLeft,topRight)".to_string(),
                ));
            }
            RegionShape::rect(index, Point::from_value(vals[0])?, Point::from_value(vals[1])?)?
        } else if let Some(spec) = shapes
            .iter()
            .find(|(k, _)| k.starts_with("$poly"))
            .map(|(_, v)| v)
        {
            let points = values_of(spec)
                .into_iter()
                .map(Point::from_value)
                .collect::<Result<Vec<_>>>()?;
            RegionShape::polygon(index, points)?
        } else {
            let name = shapes.keys().next().cloned().unwrap_or_default();
            return Err(MeridianError::InvalidQuery(format!(
                "unknown $within type: {}",
                name
            )));
        };

        return Ok(GeoCursor::Browse(RegionBrowse::new(
            index,
            tree,
            store,
            shape,
            residual_matcher(query, index),
        )));
    }

    Err(missing())
}

fn residual_matcher(query: &Value, index: &Geo2dIndex) -> Option<Box<dyn Matcher>> {
    let matcher = QueryMatcher::new(query, index.geo_field());
    if matcher.is_trivial() {
        None
    } else {
        Some(Box::new(matcher))
    }
}

fn parse_center(spec: &Value, op: &str) -> Result<(Point, f64)> {
    let vals = values_of(spec);
    if vals.len() != 2 {
        return Err(MeridianError::InvalidQuery(format!(
            "{} needs 2 fields (middle,max distance)",
            op
        )));
    }
    if !(vals[0].is_object() || vals[0].is_array()) {
        return Err(MeridianError::InvalidQuery(format!(
            "the first field of {} object must be a location object",
            op
        )));
    }
    let center = Point::from_value(vals[0])?;
    let radius = as_number(vals[1]).unwrap_or(0.0);
    Ok((center, radius))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemCollection;
    use meridian_common::GeoIndexOptions;
    use serde_json::json;

    fn index() -> Geo2dIndex {
        Geo2dIndex::new("loc", vec![], GeoIndexOptions::default()).unwrap()
    }

    fn collection(g: &Geo2dIndex, points: &[(f64, f64)]) -> MemCollection {
        let mut c = MemCollection::new();
        for (i, (x, y)) in points.iter().enumerate() {
            c.insert(g, json!({"_id": i as u64, "loc": [x, y]})).unwrap();
        }
        c
    }

    fn all_ids(cursor: &mut GeoCursor) -> Vec<u64> {
        let mut out = Vec::new();
        while cursor.ok() {
            out.push(cursor.current().unwrap().doc["_id"].as_u64().unwrap());
            if !cursor.advance() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_suitability_operators_are_optimal() {
        let g = index();
        for q in [
            json!({"loc": {"$near": [0.0, 0.0]}}),
            json!({"loc": {"$nearSphere": [0.0, 0.0]}}),
            json!({"loc": {"$near": [0.0, 0.0], "$maxDistance": 5.0}}),
            json!({"loc": {"$within": {"$box": [[0, 0], [1, 1]]}}}),
        ] {
            assert_eq!(suitability(&g, &q), Suitability::Optimal);
        }
    }

    #[test]
    fn test_suitability_equality_shapes() {
        let g = index();
        assert_eq!(
            suitability(&g, &json!({"loc": [1.0, 2.0]})),
            Suitability::Helpful
        );
        assert_eq!(
            suitability(&g, &json!({"loc": {"x": 1.0, "y": 2.0}})),
            Suitability::Helpful
        );
        // Residual terms make the equality shape unusable.
        assert_eq!(
            suitability(&g, &json!({"loc": [1.0, 2.0], "kind": "cafe"})),
            Suitability::Useless
        );
    }

    #[test]
    fn test_suitability_useless_shapes() {
        let g = index();
        assert_eq!(suitability(&g, &json!({"kind": "cafe"})), Suitability::Useless);
        assert_eq!(suitability(&g, &json!({"loc": 5})), Suitability::Useless);
        assert_eq!(suitability(&g, &json!({"loc": "string"})), Suitability::Useless);
    }

    #[test]
    fn test_near_query_scenario() {
        let g = index();
        let c = collection(&g, &[(1.0, 1.0), (4.0, 5.0), (100.0, 100.0)]);

        let mut cursor = new_cursor(
            &g,
            &c,
            &c,
            &json!({"loc": {"$near": [0.0, 0.0], "$maxDistance": 10.0}}),
            2,
        )
        .unwrap();

        assert_eq!(all_ids(&mut cursor), vec![0, 1]);
    }

    #[test]
    fn test_near_max_distance_in_tuple() {
        let g = index();
        let c = collection(&g, &[(1.0, 1.0), (4.0, 5.0), (100.0, 100.0)]);

        let mut cursor = new_cursor(&g, &c, &c, &json!({"loc": {"$near": [0.0, 0.0, 3.0]}}), 10)
            .unwrap();
        // Only (1, 1) is within 3.
        assert_eq!(all_ids(&mut cursor), vec![0]);

        // Explicit $maxDistance overrides the tuple element.
        let mut cursor = new_cursor(
            &g,
            &c,
            &c,
            &json!({"loc": {"$near": [0.0, 0.0, 3.0], "$maxDistance": 10.0}}),
            10,
        )
        .unwrap();
        assert_eq!(all_ids(&mut cursor), vec![0, 1]);
    }

    #[test]
    fn test_within_center() {
        let g = index();
        let c = collection(&g, &[(1.0, 1.0), (9.0, 0.0), (11.0, 0.0)]);

        let mut cursor = new_cursor(
            &g,
            &c,
            &c,
            &json!({"loc": {"$within": {"$center": [[0.0, 0.0], 10.0]}}}),
            0,
        )
        .unwrap();
        let mut ids = all_ids(&mut cursor);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_within_box() {
        let g = index();
        let c = collection(&g, &[(29.763, -95.363), (32.9570255, -96.1082497)]);

        let mut cursor = new_cursor(
            &g,
            &c,
            &c,
            &json!({"loc": {"$within": {"$box": [
                [29.762283, -95.364271],
                [29.764283000000002, -95.36227099999999]
            ]}}}),
            0,
        )
        .unwrap();
        assert_eq!(all_ids(&mut cursor), vec![0]);
    }

    #[test]
    fn test_within_polygon() {
        let g = index();
        let c = collection(&g, &[(5.0, 5.0), (50.0, 50.0)]);

        let mut cursor = new_cursor(
            &g,
            &c,
            &c,
            &json!({"loc": {"$within": {"$polygon": [
                [0.0, 0.0], [0.0, 10.0], [10.0, 10.0], [10.0, 0.0]
            ]}}}),
            0,
        )
        .unwrap();
        assert_eq!(all_ids(&mut cursor), vec![0]);
    }

    #[test]
    fn test_within_center_sphere() {
        let g = index();
        let c = collection(&g, &[(0.0, 0.0), (1.0, 0.0), (10.0, 0.0)]);

        let radius = 2f64.to_radians();
        let mut cursor = new_cursor(
            &g,
            &c,
            &c,
            &json!({"loc": {"$within": {"$centerSphere": [[0.0, 0.0], radius]}}}),
            0,
        )
        .unwrap();
        let mut ids = all_ids(&mut cursor);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_unknown_within_shape_rejected() {
        let g = index();
        let c = collection(&g, &[(1.0, 1.0)]);

        let err = new_cursor(
            &g,
            &c,
            &c,
            &json!({"loc": {"$within": {"$oval": [[0, 0], 1]}}}),
            0,
        )
        .unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("$oval"));
    }

    #[test]
    fn test_invalid_near_suffix_rejected() {
        let g = index();
        let c = collection(&g, &[(1.0, 1.0)]);

        let err = new_cursor(&g, &c, &c, &json!({"loc": {"$nearest": [0, 0]}}), 0).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_missing_geo_clause_rejected() {
        let g = index();
        let c = collection(&g, &[(1.0, 1.0)]);

        let err = new_cursor(&g, &c, &c, &json!({"kind": "cafe"}), 0).unwrap_err();
        assert!(err.to_string().contains("missing geo field"));
    }

    #[test]
    fn test_near_with_residual_query() {
        let g = index();
        let mut c = MemCollection::new();
        c.insert(&g, json!({"_id": 0, "loc": [1.0, 1.0], "kind": "cafe"}))
            .unwrap();
        c.insert(&g, json!({"_id": 1, "loc": [2.0, 2.0], "kind": "bar"}))
            .unwrap();

        let mut cursor = new_cursor(
            &g,
            &c,
            &c,
            &json!({"loc": {"$near": [0.0, 0.0]}, "kind": "bar"}),
            10,
        )
        .unwrap();
        assert_eq!(all_ids(&mut cursor), vec![1]);
    }

    #[test]
    fn test_negative_num_wanted_is_absolute() {
        let g = index();
        let c = collection(&g, &[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)]);

        let mut cursor =
            new_cursor(&g, &c, &c, &json!({"loc": {"$near": [0.0, 0.0]}}), -2).unwrap();
        assert_eq!(all_ids(&mut cursor).len(), 2);
    }
}
