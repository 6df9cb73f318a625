//! JSON merge helpers used for project templates and plugin settings defaults.

use serde_json::{Map, Value};

/// Deep-merge `right` over `left`.
///
/// - a missing operand yields a copy of the other one
/// - if either side is an array, `right` replaces `left` wholesale
/// - two objects merge key by key, recursing into shared keys
/// - anything else: `right` wins
pub fn deep_merge(left: Option<&Value>, right: Option<&Value>) -> Value {
    match (left, right) {
        (None, None) => Value::Null,
        (Some(l), None) => l.clone(),
        (None, Some(r)) => r.clone(),
        (Some(Value::Object(l)), Some(Value::Object(r))) => {
            let mut merged = l.clone();
            for (key, rv) in r {
                let value = deep_merge(l.get(key), Some(rv));
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (Some(_), Some(r)) => r.clone(),
    }
}

/// Fold a list of documents left to right with [`deep_merge`].
pub fn merge_all<'a, I>(documents: I) -> Value
where
    I: IntoIterator<Item = &'a Value>,
{
    documents
        .into_iter()
        .fold(None, |acc: Option<Value>, doc| {
            Some(deep_merge(acc.as_ref(), Some(doc)))
        })
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// Fill gaps in `target` from `defaults` without overwriting anything already
/// set. Returns whether `target` changed.
pub fn fill_defaults(target: &mut Value, defaults: &Value) -> bool {
    match (target, defaults) {
        (Value::Object(t), Value::Object(d)) => {
            let mut changed = false;
            for (key, dv) in d {
                match t.get_mut(key) {
                    Some(tv) => changed |= fill_defaults(tv, dv),
                    None => {
                        t.insert(key.clone(), dv.clone());
                        changed = true;
                    }
                }
            }
            changed
        }
        (t, d) => {
            if t.is_null() && !d.is_null() {
                *t = d.clone();
                return true;
            }
            false
        }
    }
}

/// Fill defaults at a dotted `path` inside `config`, creating intermediate
/// objects where needed. Non-object values on the path are left untouched.
pub fn ensure_defaults_at(config: &mut Value, path: &str, defaults: &Value) -> bool {
    if config.is_null() {
        *config = Value::Object(Map::new());
    }

    let mut cursor = config;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let Value::Object(map) = cursor else {
            tracing::warn!(path, segment, "settings path crosses a non-object value");
            return false;
        };
        cursor = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    fill_defaults(cursor, defaults)
}
