//! Persistent secondary index (spec §4.3): same [`Index`] contract as
//! [`super::InMemoryIndex`], atop the backend's duplicate-sort ordered
//! table named `_<storeName>-<indexName>` (spec §6 "Persisted layout").

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::Index;
use crate::backend::PersistentIndexBackend;
use crate::error::Result;
use crate::key::{PrimaryKey, SecondaryKey};
use crate::keyrange::KeyRange;
use crate::value::{KeyPath, Value};

/// Order-preserving byte encoding for a [`SecondaryKey`]: the tag byte
/// matches [`SecondaryKey`]'s own variant ranking, so bytewise comparison
/// of two encodings agrees with `SecondaryKey::cmp` (spec §9 comparison
/// quirk resolution, extended to the on-disk representation).
pub fn encode_secondary_key(key: &SecondaryKey) -> Vec<u8> {
    match key {
        SecondaryKey::Bytes(b) => {
            let mut out = vec![0u8];
            out.extend_from_slice(b);
            out
        }
        SecondaryKey::Number(n) => {
            let mut out = vec![1u8];
            out.extend_from_slice(&order_preserving_f64(*n));
            out
        }
        SecondaryKey::Str(s) => {
            let mut out = vec![2u8];
            out.extend_from_slice(s.as_bytes());
            out
        }
        SecondaryKey::Compound(parts) => {
            let mut out = vec![3u8];
            for p in parts {
                out.extend(escape_terminate(&encode_secondary_key(p)));
            }
            out
        }
    }
}

/// Flips an IEEE-754 f64's bit pattern so big-endian byte comparison
/// matches numeric order: negatives get every bit flipped, non-negatives
/// get only the sign bit flipped.
fn order_preserving_f64(n: f64) -> [u8; 8] {
    let bits = n.to_bits();
    let flipped = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
    flipped.to_be_bytes()
}

/// Escapes embedded `0x00` as `0x00 0xFF` and appends a `0x00 0x00`
/// terminator, so concatenating several of these preserves the
/// element-wise (tuple) ordering of the unescaped segments.
fn escape_terminate(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 2);
    for &b in bytes {
        out.push(b);
        if b == 0 {
            out.push(0xFF);
        }
    }
    out.push(0);
    out.push(0);
    out
}

fn range_includes_bytes(query: &KeyRange, candidate: &[u8]) -> bool {
    let lower_ok = match &query.lower {
        None => true,
        Some(l) => {
            let lb = encode_secondary_key(l);
            candidate > lb.as_slice() || (!query.lower_open && candidate == lb.as_slice())
        }
    };
    let upper_ok = match &query.upper {
        None => true,
        Some(u) => {
            let ub = encode_secondary_key(u);
            candidate < ub.as_slice() || (!query.upper_open && candidate == ub.as_slice())
        }
    };
    lower_ok && upper_ok
}

#[derive(Debug, Clone)]
pub struct PersistentIndex {
    name: String,
    table: String,
    key_path: KeyPath,
    unique: bool,
    multi_entry: bool,
    backend: Arc<dyn PersistentIndexBackend>,
}

impl PersistentIndex {
    pub fn new(
        store_name: &str,
        name: impl Into<String>,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
        backend: Arc<dyn PersistentIndexBackend>,
    ) -> Self {
        let name = name.into();
        let table = format!("_{store_name}-{name}");
        Self {
            name,
            table,
            key_path,
            unique,
            multi_entry,
            backend,
        }
    }

    fn extract(&self, value: &Value) -> Vec<SecondaryKey> {
        self.key_path.secondary_keys(value, self.multi_entry)
    }
}

#[async_trait]
impl Index for PersistentIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, primary_key: &PrimaryKey, new_value: Option<&Value>, old_value: Option<&Value>) -> Result<()> {
        let old_keys = old_value.map(|v| self.extract(v)).unwrap_or_default();
        let new_keys = new_value.map(|v| self.extract(v)).unwrap_or_default();
        if old_keys == new_keys {
            return Ok(());
        }
        for k in &old_keys {
            self.backend
                .remove(&self.table, &encode_secondary_key(k), primary_key)
                .await?;
        }
        for k in &new_keys {
            self.backend
                .put(&self.table, &encode_secondary_key(k), primary_key, self.unique)
                .await?;
        }
        Ok(())
    }

    async fn remove(&self, primary_key: &PrimaryKey, old_value: Option<&Value>) -> Result<()> {
        let old_keys = old_value.map(|v| self.extract(v)).unwrap_or_default();
        for k in &old_keys {
            self.backend
                .remove(&self.table, &encode_secondary_key(k), primary_key)
                .await?;
        }
        Ok(())
    }

    async fn keys(&self, query: &KeyRange, limit: Option<usize>) -> Result<Vec<PrimaryKey>> {
        let entries = self.backend.scan(&self.table, true).await?;
        let mut out = Vec::new();
        for (k, pk) in entries {
            if !range_includes_bytes(query, &k) {
                continue;
            }
            out.push(Bytes::from(pk));
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn min_keys(&self) -> Result<Vec<PrimaryKey>> {
        let entries = self.backend.scan(&self.table, true).await?;
        let Some((min_key, _)) = entries.first() else {
            return Ok(Vec::new());
        };
        let min_key = min_key.clone();
        Ok(entries
            .into_iter()
            .take_while(|(k, _)| *k == min_key)
            .map(|(_, pk)| Bytes::from(pk))
            .collect())
    }

    async fn max_keys(&self) -> Result<Vec<PrimaryKey>> {
        let entries = self.backend.scan(&self.table, false).await?;
        let Some((max_key, _)) = entries.first() else {
            return Ok(Vec::new());
        };
        let max_key = max_key.clone();
        Ok(entries
            .into_iter()
            .take_while(|(k, _)| *k == max_key)
            .map(|(_, pk)| Bytes::from(pk))
            .collect())
    }

    async fn truncate(&self) -> Result<()> {
        self.backend.truncate(&self.table).await
    }

    async fn key_stream(&self, ascending: bool, query: &KeyRange, callback: &mut (dyn FnMut(&PrimaryKey) -> bool + Send)) {
        let Ok(entries) = self.backend.scan(&self.table, ascending).await else {
            return;
        };
        for (k, pk) in entries {
            if !range_includes_bytes(query, &k) {
                continue;
            }
            let primary = Bytes::from(pk);
            if !callback(&primary) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    fn obj(k: &str, v: Value) -> Value {
        Value::Object([(k.to_string(), v)].into_iter().collect())
    }

    fn pk(s: &str) -> PrimaryKey {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn unique_persistent_index_rejects_duplicates() {
        let backend = Arc::new(InMemoryBackend::new());
        let idx = PersistentIndex::new("store", "byVal", KeyPath::Single("val".into()), true, false, backend);
        idx.put(&pk("k1"), Some(&obj("val", Value::Number(1.0))), None).await.unwrap();
        let err = idx
            .put(&pk("k2"), Some(&obj("val", Value::Number(1.0))), None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn range_query_filters_by_encoded_bounds() {
        let backend = Arc::new(InMemoryBackend::new());
        let idx = PersistentIndex::new("store", "byVal", KeyPath::Single("val".into()), false, false, backend);
        for (k, v) in [("k1", 1.0), ("k2", 5.0), ("k3", 9.0)] {
            idx.put(&pk(k), Some(&obj("val", Value::Number(v))), None).await.unwrap();
        }
        let range = KeyRange::bound(SecondaryKey::Number(2.0), SecondaryKey::Number(9.0), false, true);
        let mut found = idx.keys(&range, None).await.unwrap();
        found.sort();
        assert_eq!(found, vec![pk("k2")]);
    }

    #[test]
    fn byte_encoding_preserves_numeric_order() {
        let a = encode_secondary_key(&SecondaryKey::Number(-3.5));
        let b = encode_secondary_key(&SecondaryKey::Number(2.0));
        assert!(a < b);
    }
}
