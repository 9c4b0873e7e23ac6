//! Dotted-path navigation over JSON documents.
//!
//! Index key extraction and residual matching both address documents by
//! dotted field paths ("a.b.c"). Arrays encountered along the way fan the
//! lookup out across their elements; an array sitting at the final
//! segment is returned whole rather than element by element.

use serde_json::Value;

/// Collects every value reached by walking `path` through `doc`.
///
/// Intermediate arrays are expanded (each object element is searched);
/// the value at the last segment is collected as-is. Missing fields
/// contribute nothing.
pub fn fields_dotted<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    walk(doc, &segments, false, &mut out);
    out
}

/// Like [`fields_dotted`], but an array found at the final segment is
/// expanded into its elements instead of collected whole.
pub fn fields_dotted_expanded<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    walk(doc, &segments, true, &mut out);
    out
}

fn walk<'a>(value: &'a Value, segments: &[&str], expand_last: bool, out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        match value {
            Value::Array(items) if expand_last => out.extend(items.iter()),
            _ => out.push(value),
        }
        return;
    };

    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                walk(next, rest, expand_last, out);
            }
        }
        Value::Array(items) => {
            // Fan out across elements; only objects can carry the field.
            for item in items {
                if item.is_object() {
                    walk(item, segments, expand_last, out);
                }
            }
        }
        _ => {}
    }
}

/// Numeric coercion: integers and floats both read as f64.
pub fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Returns the values of an object or array in order.
///
/// Locations are written either as `{x: .., y: ..}` objects or `[x, y]`
/// arrays; both shapes iterate the same way here.
pub fn values_of(value: &Value) -> Vec<&Value> {
    match value {
        Value::Object(map) => map.values().collect(),
        Value::Array(items) => items.iter().collect(),
        _ => Vec::new(),
    }
}
