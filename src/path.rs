//! Dotted-path navigation over dynamic values
//!
//! Request parameters, attributes and results are loosely structured
//! [`serde_json::Value`] trees. Observers and matchers address into them
//! with dotted paths such as `"user.id"` or `"0.items.2"`.
//!
//! # Contract
//!
//! - [`get_path`] never fails: any traversal problem yields `None`.
//! - [`set_path`] auto-vivifies. A missing or non-container intermediate
//!   is replaced by an empty mapping. On a sequence, an in-range index
//!   replaces and an index equal to the length appends. On a mapping, a
//!   numeric segment is an ordinary string key.

use serde_json::{Map, Value};

use crate::error::CallError;

/// One step of a [`ValuePath`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    fn as_key(&self) -> String {
        match self {
            Self::Key(k) => k.clone(),
            Self::Index(i) => i.to_string(),
        }
    }
}

/// Parsed dotted path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePath {
    raw: String,
    segments: Vec<Segment>,
}

impl ValuePath {
    /// Parse a dotted path. Empty segments (`"a..b"`, leading dots) are rejected.
    pub fn parse(raw: &str) -> Result<Self, CallError> {
        if raw.is_empty() {
            return Ok(Self {
                raw: String::new(),
                segments: Vec::new(),
            });
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            if part.is_empty() {
                return Err(CallError::InvalidPath {
                    path: raw.to_string(),
                    reason: "empty segment".to_string(),
                });
            }
            match part.parse::<usize>() {
                Ok(index) => segments.push(Segment::Index(index)),
                Err(_) => segments.push(Segment::Key(part.to_string())),
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Resolve `path` inside `root`
pub fn get_path<'a>(root: &'a Value, path: &ValuePath) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.segments() {
        current = match (current, segment) {
            (Value::Object(map), segment) => map.get(&segment.as_key())?,
            (Value::Array(items), Segment::Index(i)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// `get_path` that treats an explicit `null` the same as a missing value
pub fn get_present<'a>(root: &'a Value, path: &ValuePath) -> Option<&'a Value> {
    get_path(root, path).filter(|v| !v.is_null())
}

/// Write `new` at `path` inside `root`, creating intermediate mappings
pub fn set_path(root: &mut Value, path: &ValuePath, new: Value) {
    let Some((last, parents)) = path.segments().split_last() else {
        *root = new;
        return;
    };

    let mut current = root;
    for segment in parents {
        let Some(next) = child_mut(current, segment) else {
            return;
        };
        current = next;
    }
    assign(current, last, new);
}

/// Container under `segment`, created if needed; `None` only if `node` could not become one
fn child_mut<'a>(node: &'a mut Value, segment: &Segment) -> Option<&'a mut Value> {
    let array_slot = match (&*node, segment) {
        (Value::Array(items), Segment::Index(i)) if *i <= items.len() => Some(*i),
        _ => None,
    };

    match (node, array_slot) {
        (Value::Array(items), Some(i)) => {
            if i == items.len() {
                items.push(Value::Object(Map::new()));
            }
            let slot = items.get_mut(i)?;
            if !is_container(slot) {
                *slot = Value::Object(Map::new());
            }
            Some(slot)
        }
        (node, _) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            match node {
                Value::Object(map) => {
                    let entry = map
                        .entry(segment.as_key())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !is_container(entry) {
                        *entry = Value::Object(Map::new());
                    }
                    Some(entry)
                }
                _ => None,
            }
        }
    }
}

fn is_container(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

fn assign(node: &mut Value, segment: &Segment, new: Value) {
    if let (Value::Array(items), Segment::Index(i)) = (&mut *node, segment) {
        if let Some(slot) = items.get_mut(*i) {
            *slot = new;
            return;
        }
        if *i == items.len() {
            items.push(new);
            return;
        }
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(segment.as_key(), new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(raw: &str) -> ValuePath {
        ValuePath::parse(raw).unwrap()
    }

    #[test]
    fn test_get_nested_mapping_and_sequence() {
        let value = json!({"user": {"roles": ["admin", "ops"], "id": 7}});
        assert_eq!(get_path(&value, &path("user.id")), Some(&json!(7)));
        assert_eq!(get_path(&value, &path("user.roles.1")), Some(&json!("ops")));
        assert_eq!(get_path(&value, &path("user.roles.5")), None);
        assert_eq!(get_path(&value, &path("user.id.deeper")), None);
        assert_eq!(get_path(&value, &path("")), Some(&value));
    }

    #[test]
    fn test_get_present_skips_null() {
        let value = json!({"a": null, "b": 0});
        assert_eq!(get_present(&value, &path("a")), None);
        assert_eq!(get_present(&value, &path("b")), Some(&json!(0)));
    }

    #[test]
    fn test_set_auto_vivifies_mappings() {
        let mut value = json!({});
        set_path(&mut value, &path("a.b.c"), json!(1));
        assert_eq!(value, json!({"a": {"b": {"c": 1}}}));

        // scalar in the way is replaced by a mapping
        let mut value = json!({"a": 5});
        set_path(&mut value, &path("a.b"), json!(true));
        assert_eq!(value, json!({"a": {"b": true}}));
    }

    #[test]
    fn test_set_on_sequences() {
        let mut value = json!([1, 2]);
        set_path(&mut value, &path("0"), json!("x"));
        set_path(&mut value, &path("2"), json!("appended"));
        assert_eq!(value, json!(["x", 2, "appended"]));

        // out of range on a sequence turns it into a mapping keyed by the index
        let mut value = json!({"list": []});
        set_path(&mut value, &path("list.3"), json!(1));
        assert_eq!(value, json!({"list": {"3": 1}}));
    }

    #[test]
    fn test_numeric_segment_on_mapping_is_string_key() {
        let mut value = json!({"m": {}});
        set_path(&mut value, &path("m.0.name"), json!("n"));
        assert_eq!(value, json!({"m": {"0": {"name": "n"}}}));
        assert_eq!(get_path(&value, &path("m.0.name")), Some(&json!("n")));
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(ValuePath::parse("a..b").is_err());
        assert!(ValuePath::parse(".a").is_err());
    }
}
