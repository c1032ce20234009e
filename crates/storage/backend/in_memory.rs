//! Default backend: an in-process `BTreeMap` store. Used when no persistent
//! engine is configured and by every test in this crate.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Batch, PersistentBackend, PersistentIndexBackend};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
    index_tables: HashMap<String, BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("in-memory backend lock poisoned")
    }
}

#[async_trait]
impl PersistentBackend for InMemoryBackend {
    async fn create_table(&self, table: &str) -> Result<()> {
        self.lock().tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.lock().tables.remove(table);
        Ok(())
    }

    async fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().tables.get(table).and_then(|t| t.get(key).cloned()))
    }

    async fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, table: &str, key: &[u8]) -> Result<()> {
        if let Some(t) = self.lock().tables.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    async fn count(&self, table: &str) -> Result<usize> {
        Ok(self.lock().tables.get(table).map(|t| t.len()).unwrap_or(0))
    }

    async fn min_key(&self, table: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.keys().next().cloned()))
    }

    async fn max_key(&self, table: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.keys().next_back().cloned()))
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        if let Some(t) = self.lock().tables.get_mut(table) {
            t.clear();
        }
        Ok(())
    }

    async fn scan(&self, table: &str, ascending: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.lock();
        let Some(t) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<_> = t.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if !ascending {
            entries.reverse();
        }
        Ok(entries)
    }

    async fn apply_batch(&self, batch: Batch) -> Result<()> {
        let mut inner = self.lock();
        for (table, key, primary_key, no_overwrite) in &batch.index_puts {
            if *no_overwrite {
                if let Some(existing) = inner.index_tables.get(table).and_then(|t| t.get(key)) {
                    if !existing.is_empty() && !existing.contains(primary_key) {
                        return Err(Error::ConstraintViolation { index: table.clone() });
                    }
                }
            }
        }
        for (table, key, value) in &batch.puts {
            inner
                .tables
                .entry(table.clone())
                .or_default()
                .insert(key.clone(), value.clone());
        }
        for (table, key) in &batch.removes {
            if let Some(t) = inner.tables.get_mut(table) {
                t.remove(key);
            }
        }
        for (table, key, primary_key, _) in &batch.index_puts {
            inner
                .index_tables
                .entry(table.clone())
                .or_default()
                .entry(key.clone())
                .or_default()
                .insert(primary_key.clone());
        }
        for (table, key, primary_key) in &batch.index_removes {
            if let Some(t) = inner.index_tables.get_mut(table) {
                let mut drop_key = false;
                if let Some(set) = t.get_mut(key) {
                    set.remove(primary_key);
                    drop_key = set.is_empty();
                }
                if drop_key {
                    t.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentIndexBackend for InMemoryBackend {
    async fn put(&self, table: &str, key: &[u8], primary_key: &[u8], no_overwrite: bool) -> Result<()> {
        let mut inner = self.lock();
        if no_overwrite {
            if let Some(existing) = inner.index_tables.get(table).and_then(|t| t.get(key)) {
                if !existing.is_empty() && !existing.contains(primary_key) {
                    return Err(Error::ConstraintViolation { index: table.to_string() });
                }
            }
        }
        inner
            .index_tables
            .entry(table.to_string())
            .or_default()
            .entry(key.to_vec())
            .or_default()
            .insert(primary_key.to_vec());
        Ok(())
    }

    async fn remove(&self, table: &str, key: &[u8], primary_key: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let mut drop_key = false;
        if let Some(t) = inner.index_tables.get_mut(table) {
            if let Some(set) = t.get_mut(key) {
                set.remove(primary_key);
                drop_key = set.is_empty();
            }
            if drop_key {
                t.remove(key);
            }
        }
        Ok(())
    }

    async fn scan(&self, table: &str, ascending: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.lock();
        let Some(t) = inner.index_tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for (k, set) in t.iter() {
            for pk in set {
                entries.push((k.clone(), pk.clone()));
            }
        }
        if !ascending {
            entries.reverse();
        }
        Ok(entries)
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        self.lock().index_tables.remove(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let backend = InMemoryBackend::new();
        backend.create_table("t").await.unwrap();
        backend.put("t", b"k", b"v").await.unwrap();
        assert_eq!(backend.get("t", b"k").await.unwrap(), Some(b"v".to_vec()));
        backend.remove("t", b"k").await.unwrap();
        assert_eq!(backend.get("t", b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn apply_batch_rejects_unique_violation_atomically() {
        let backend = InMemoryBackend::new();
        let mut batch = Batch::default();
        batch.index_puts.push(("idx".into(), b"k".to_vec(), b"pk1".to_vec(), true));
        backend.apply_batch(batch).await.unwrap();

        let mut conflicting = Batch::default();
        conflicting.puts.push(("t".into(), b"a".to_vec(), b"1".to_vec()));
        conflicting
            .index_puts
            .push(("idx".into(), b"k".to_vec(), b"pk2".to_vec(), true));
        let err = backend.apply_batch(conflicting).await.unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { .. }));
        // The unrelated put in the same batch must not have been applied either.
        assert_eq!(backend.get("t", b"a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_returns_ascending_or_descending_order() {
        let backend = InMemoryBackend::new();
        for k in [b"a", b"b", b"c"] {
            backend.put("t", k, k).await.unwrap();
        }
        let asc: Vec<_> = backend.scan("t", true).await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(asc, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let desc: Vec<_> = backend.scan("t", false).await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(desc, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }
}
