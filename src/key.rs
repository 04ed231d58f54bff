//! Structural query keys.
//!
//! A key is an ordered list of JSON segments, e.g. `["tasks", "p1", {"status": "open"}]`.
//! Two keys identify the same cache entry iff every segment is deeply equal,
//! independent of the order object properties were inserted in.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Identifier for one cacheable query.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct QueryKey {
  segments: Vec<Value>,
}

impl QueryKey {
  /// Start a key with its resource name, e.g. `QueryKey::root("tasks")`.
  pub fn root(name: impl Into<String>) -> Self {
    Self {
      segments: vec![Value::String(name.into())],
    }
  }

  pub fn from_segments(segments: Vec<Value>) -> Self {
    Self { segments }
  }

  /// Append a scalar segment.
  pub fn with(mut self, segment: impl Into<Value>) -> Self {
    self.segments.push(segment.into());
    self
  }

  /// Append a record segment built from any serializable value.
  ///
  /// Fails when the value has no JSON representation (for example a map keyed
  /// by something other than strings).
  pub fn with_record<S: Serialize + ?Sized>(mut self, record: &S) -> Result<Self> {
    let value = serde_json::to_value(record).map_err(Error::serialization)?;
    self.segments.push(value);
    Ok(self)
  }

  pub fn segments(&self) -> &[Value] {
    &self.segments
  }

  pub fn len(&self) -> usize {
    self.segments.len()
  }

  pub fn is_empty(&self) -> bool {
    self.segments.is_empty()
  }

  /// The key with its last segment removed, or `None` for an empty key.
  pub fn parent(&self) -> Option<QueryKey> {
    let (_, head) = self.segments.split_last()?;
    Some(Self {
      segments: head.to_vec(),
    })
  }

  /// Canonical string form; see [`serialize`].
  pub fn serialize(&self) -> String {
    serialize(self)
  }

  /// See [`is_prefix_of`].
  pub fn is_prefix_of(&self, full: &QueryKey) -> bool {
    is_prefix_of(self, full)
  }
}

/// Stable, order-preserving string for a key.
///
/// Arrays keep their order, object properties are emitted sorted by name, so
/// `serialize(a) == serialize(b)` iff `a == b`.
pub fn serialize(key: &QueryKey) -> String {
  let mut out = String::new();
  write_array(&mut out, &key.segments);
  out
}

/// True iff `full` starts with every segment of `prefix`, compared structurally.
/// An empty prefix matches every key.
pub fn is_prefix_of(prefix: &QueryKey, full: &QueryKey) -> bool {
  prefix.segments.len() <= full.segments.len()
    && prefix
      .segments
      .iter()
      .zip(&full.segments)
      .all(|(a, b)| a == b)
}

fn write_array(out: &mut String, items: &[Value]) {
  out.push('[');
  for (i, item) in items.iter().enumerate() {
    if i > 0 {
      out.push(',');
    }
    write_value(out, item);
  }
  out.push(']');
}

fn write_value(out: &mut String, value: &Value) {
  match value {
    Value::Null => out.push_str("null"),
    Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
    Value::Number(n) => out.push_str(&n.to_string()),
    Value::String(s) => write_str(out, s),
    Value::Array(items) => write_array(out, items),
    Value::Object(map) => {
      let mut fields: Vec<_> = map.iter().collect();
      fields.sort_by(|a, b| a.0.cmp(b.0));
      out.push('{');
      for (i, (name, field)) in fields.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_str(out, name);
        out.push(':');
        write_value(out, field);
      }
      out.push('}');
    }
  }
}

fn write_str(out: &mut String, s: &str) {
  // Serializing a str cannot fail
  out.push_str(&Value::String(s.to_owned()).to_string());
}

impl Hash for QueryKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    serialize(self).hash(state);
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&serialize(self))
  }
}

impl fmt::Debug for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "QueryKey({})", serialize(self))
  }
}

impl From<&str> for QueryKey {
  fn from(name: &str) -> Self {
    Self::root(name)
  }
}

impl From<Vec<Value>> for QueryKey {
  fn from(segments: Vec<Value>) -> Self {
    Self::from_segments(segments)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::collections::{BTreeMap, HashMap};

  #[test]
  fn test_property_order_is_ignored() {
    let a: Value = serde_json::from_str(r#"{"status":"open","page":2}"#).unwrap();
    let b: Value = serde_json::from_str(r#"{"page":2,"status":"open"}"#).unwrap();

    let ka = QueryKey::root("tasks").with("p1").with(a);
    let kb = QueryKey::root("tasks").with("p1").with(b);

    assert_eq!(ka, kb);
    assert_eq!(serialize(&ka), serialize(&kb));
    assert_eq!(serialize(&ka), r#"["tasks","p1",{"page":2,"status":"open"}]"#);
  }

  #[test]
  fn test_segment_order_matters() {
    let a = QueryKey::root("tasks").with("p1").with("drafts");
    let b = QueryKey::root("tasks").with("drafts").with("p1");
    assert_ne!(a, b);
    assert_ne!(serialize(&a), serialize(&b));
  }

  #[test]
  fn test_scalar_types_are_distinguished() {
    let number = QueryKey::root("product").with(1);
    let string = QueryKey::root("product").with("1");
    assert_ne!(number, string);
    assert_ne!(number.serialize(), string.serialize());
  }

  #[test]
  fn test_strings_are_escaped() {
    let key = QueryKey::root("search").with(r#"a","b"#);
    assert_eq!(key.serialize(), r#"["search","a\",\"b"]"#);
    assert_ne!(key, QueryKey::root("search").with("a").with("b"));
  }

  #[test]
  fn test_hash_follows_structural_equality() {
    let mut map = HashMap::new();
    map.insert(QueryKey::root("jobs").with(json!({"a": 1, "b": [1, 2]})), 1);
    let lookup: Value = serde_json::from_str(r#"{"b":[1,2],"a":1}"#).unwrap();
    assert_eq!(map.get(&QueryKey::root("jobs").with(lookup)), Some(&1));
  }

  #[test]
  fn test_is_prefix_of() {
    let prefix = QueryKey::root("tasks").with("p1");
    assert!(prefix.is_prefix_of(&QueryKey::root("tasks").with("p1").with("drafts")));
    assert!(prefix.is_prefix_of(&prefix));
    assert!(!prefix.is_prefix_of(&QueryKey::root("tasks").with("p2")));
    assert!(!prefix.is_prefix_of(&QueryKey::root("tasks")));
    assert!(QueryKey::default().is_prefix_of(&prefix));
  }

  #[test]
  fn test_prefix_compares_records_structurally() {
    let prefix = QueryKey::root("tasks").with(json!({"status": "open", "owner": "ann"}));
    let full: Value = serde_json::from_str(r#"{"owner":"ann","status":"open"}"#).unwrap();
    assert!(prefix.is_prefix_of(&QueryKey::root("tasks").with(full).with(3)));
  }

  #[test]
  fn test_with_record() {
    #[derive(Serialize)]
    struct Filter {
      status: &'static str,
    }
    let key = QueryKey::root("tasks")
      .with_record(&Filter { status: "open" })
      .unwrap();
    assert_eq!(key.serialize(), r#"["tasks",{"status":"open"}]"#);
  }

  #[test]
  fn test_non_serializable_record_is_reported() {
    let mut bad = BTreeMap::new();
    bad.insert(vec![1u8], "x");
    let err = QueryKey::root("tasks").with_record(&bad).unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
  }

  #[test]
  fn test_parent() {
    let key = QueryKey::root("tasks").with("p1");
    assert_eq!(key.parent(), Some(QueryKey::root("tasks")));
    assert_eq!(QueryKey::default().parent(), None);
  }
}
