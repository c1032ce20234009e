//! LRU write-through cache in front of a [`PersistentBackend`] (spec §2
//! "Cached Backend"), keyed by `(table, key)`. Set-shaped reads (`scan`,
//! `min_key`/`max_key`, `count`) pass straight through: an LRU over
//! individual keys doesn't help a range scan.

use std::sync::Arc;

use async_trait::async_trait;
use moka::sync::Cache;

use crate::backend::{Batch, PersistentBackend};
use crate::error::Result;

const DEFAULT_CACHE_SIZE: u64 = 10_000;

#[derive(Clone, Debug)]
pub struct CachedBackend<B> {
    inner: Arc<B>,
    entries: Cache<(String, Vec<u8>), Vec<u8>>,
}

impl<B: PersistentBackend> CachedBackend<B> {
    pub fn new(inner: B) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_SIZE)
    }

    pub fn with_capacity(inner: B, capacity: u64) -> Self {
        Self {
            inner: Arc::new(inner),
            entries: Cache::builder().max_capacity(capacity).build(),
        }
    }

    fn cache_key(table: &str, key: &[u8]) -> (String, Vec<u8>) {
        (table.to_string(), key.to_vec())
    }
}

#[async_trait]
impl<B: PersistentBackend> PersistentBackend for CachedBackend<B> {
    async fn create_table(&self, table: &str) -> Result<()> {
        self.inner.create_table(table).await
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let result = self.inner.drop_table(table).await;
        self.entries.invalidate_all();
        result
    }

    async fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cache_key = Self::cache_key(table, key);
        if let Some(hit) = self.entries.get(&cache_key) {
            return Ok(Some(hit));
        }
        let value = self.inner.get(table, key).await?;
        if let Some(v) = &value {
            self.entries.insert(cache_key, v.clone());
        }
        Ok(value)
    }

    async fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(table, key, value).await?;
        self.entries.insert(Self::cache_key(table, key), value.to_vec());
        Ok(())
    }

    async fn remove(&self, table: &str, key: &[u8]) -> Result<()> {
        self.inner.remove(table, key).await?;
        self.entries.invalidate(&Self::cache_key(table, key));
        Ok(())
    }

    async fn count(&self, table: &str) -> Result<usize> {
        self.inner.count(table).await
    }

    async fn min_key(&self, table: &str) -> Result<Option<Vec<u8>>> {
        self.inner.min_key(table).await
    }

    async fn max_key(&self, table: &str) -> Result<Option<Vec<u8>>> {
        self.inner.max_key(table).await
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        self.inner.truncate(table).await?;
        self.entries.invalidate_all();
        Ok(())
    }

    async fn scan(&self, table: &str, ascending: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan(table, ascending).await
    }

    async fn apply_batch(&self, batch: Batch) -> Result<()> {
        let puts: Vec<(String, Vec<u8>, Vec<u8>)> = batch.puts.clone();
        let removes: Vec<(String, Vec<u8>)> = batch.removes.clone();
        self.inner.apply_batch(batch).await?;
        for (table, key, value) in puts {
            self.entries.insert(Self::cache_key(&table, &key), value);
        }
        for (table, key) in removes {
            self.entries.invalidate(&Self::cache_key(&table, &key));
        }
        Ok(())
    }

    async fn request_resize(&self, additional_bytes: usize) -> Result<()> {
        self.inner.request_resize(additional_bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    #[tokio::test]
    async fn get_after_put_is_served_from_cache() {
        let cached = CachedBackend::new(InMemoryBackend::new());
        cached.put("t", b"k", b"v").await.unwrap();
        assert_eq!(cached.get("t", b"k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn remove_invalidates_the_cached_entry() {
        let cached = CachedBackend::new(InMemoryBackend::new());
        cached.put("t", b"k", b"v").await.unwrap();
        cached.remove("t", b"k").await.unwrap();
        assert_eq!(cached.get("t", b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn miss_populates_cache_from_the_inner_backend() {
        let inner = InMemoryBackend::new();
        inner.put("t", b"k", b"v").await.unwrap();
        let cached = CachedBackend::new(inner);
        assert_eq!(cached.get("t", b"k").await.unwrap(), Some(b"v".to_vec()));
    }
}
