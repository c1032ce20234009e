//! The structured value representation that secondary-key extraction walks.
//!
//! The actual bytes a caller stores are opaque to the core (serialization is
//! an external collaborator, spec §1); `Value` is the in-process shape the
//! core needs in order to walk a key path and pull out a secondary key
//! *before* the value is handed to a [`crate::codec::Codec`] for encoding.

use std::collections::BTreeMap;

use crate::key::SecondaryKey;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(name),
            _ => None,
        }
    }

    /// Dot-path nested lookup: `"a.b.c"` walks `a`, then `b`, then `c`.
    fn walk_dot_path(&self, path: &str) -> Option<&Value> {
        let mut cur = self;
        for segment in path.split('.') {
            cur = cur.field(segment)?;
        }
        Some(cur)
    }

    /// Converts a scalar leaf into a comparable secondary key. Compound
    /// values (`Array`, `Object`) and non-indexable scalars (`Null`) are not
    /// representable as a single key and yield `None`.
    pub fn to_secondary_key(&self) -> Option<SecondaryKey> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(SecondaryKey::Number(if *b { 1.0 } else { 0.0 })),
            Value::Number(n) => Some(SecondaryKey::Number(*n)),
            Value::Str(s) => Some(SecondaryKey::Str(s.clone())),
            Value::Bytes(b) => Some(SecondaryKey::Bytes(b.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

/// A key path as accepted by `createIndex` (spec §6 "Index configuration").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPath {
    /// A single, possibly dotted, field name.
    Single(String),
    /// An ordered sequence of field names producing a compound key.
    Sequence(Vec<String>),
}

/// What `extract` found at a key path before multi-entry expansion: either a
/// single scalar/array `Value`, or one compound value built from several
/// independently-resolved fields.
pub enum Extracted {
    Single(Value),
    Compound(Vec<Value>),
}

impl KeyPath {
    pub fn extract(&self, value: &Value) -> Option<Extracted> {
        match self {
            KeyPath::Single(path) => value.walk_dot_path(path).cloned().map(Extracted::Single),
            KeyPath::Sequence(fields) => {
                let mut parts = Vec::with_capacity(fields.len());
                for f in fields {
                    parts.push(value.walk_dot_path(f).cloned()?);
                }
                Some(Extracted::Compound(parts))
            }
        }
    }

    /// Resolves `extract` all the way down to the secondary key(s) this
    /// key path contributes for `value`, honoring `multi_entry` (spec §4.2
    /// step 3): when set and the extracted single value is itself a
    /// sequence, each element becomes its own secondary key.
    pub fn secondary_keys(&self, value: &Value, multi_entry: bool) -> Vec<SecondaryKey> {
        match self.extract(value) {
            None => Vec::new(),
            Some(Extracted::Compound(parts)) => {
                let mut keys = Vec::with_capacity(parts.len());
                for p in &parts {
                    match p.to_secondary_key() {
                        Some(k) => keys.push(k),
                        None => return Vec::new(),
                    }
                }
                vec![SecondaryKey::Compound(keys)]
            }
            Some(Extracted::Single(Value::Array(items))) if multi_entry => items
                .iter()
                .filter_map(Value::to_secondary_key)
                .collect(),
            Some(Extracted::Single(v)) => v.to_secondary_key().into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(pairs: &[(&str, Value)]) -> Value {
        Value::Object(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn dot_path_walks_nested_objects() {
        let v = obj(&[("a", obj(&[("b", Value::Str("x".into()))]))]);
        let path = KeyPath::Single("a.b".into());
        let keys = path.secondary_keys(&v, false);
        assert_eq!(keys, vec![SecondaryKey::Str("x".into())]);
    }

    #[test]
    fn missing_segment_yields_no_keys() {
        let v = obj(&[("a", Value::Null)]);
        let path = KeyPath::Single("a.b".into());
        assert!(path.secondary_keys(&v, false).is_empty());
    }

    #[test]
    fn multi_entry_expands_array_elements() {
        let v = obj(&[(
            "tags",
            Value::Array(vec![Value::Str("a".into()), Value::Str("b".into())]),
        )]);
        let path = KeyPath::Single("tags".into());
        let keys = path.secondary_keys(&v, true);
        assert_eq!(
            keys,
            vec![SecondaryKey::Str("a".into()), SecondaryKey::Str("b".into())]
        );
    }

    #[test]
    fn sequence_builds_compound_key() {
        let v = obj(&[("a", Value::Number(1.0)), ("b", Value::Str("y".into()))]);
        let path = KeyPath::Sequence(vec!["a".into(), "b".into()]);
        let keys = path.secondary_keys(&v, false);
        assert_eq!(
            keys,
            vec![SecondaryKey::Compound(vec![
                SecondaryKey::Number(1.0),
                SecondaryKey::Str("y".into())
            ])]
        );
    }
}
