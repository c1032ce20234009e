//! The persistent backend contract (spec §1 "Out of scope" / §9
//! "Async/cooperative"): memory-mapped-file-engine semantics behind a
//! trait, so the transaction core never depends on a concrete engine.
//!
//! `async` throughout, matching the teacher's `StorageBackend` trait
//! (`crates/storage/api/mod.rs` in the original tree): these are the only
//! real suspension points in the whole crate (spec §5). The in-memory
//! backend never actually yields; [`redb`](crate::backend::redb_backend) is
//! the one that does real I/O.

pub mod in_memory;
#[cfg(feature = "redb")]
pub mod redb_backend;

use async_trait::async_trait;

use crate::error::Result;

pub use in_memory::InMemoryBackend;

/// One atomic unit of work applied across any number of tables: the write
/// set a Transaction flattens into its parent, or the batch a combined
/// commit submits as one native transaction (spec §4.5 step 2c, §4.6 step
/// 2-3).
#[derive(Debug, Default, Clone)]
pub struct Batch {
    pub puts: Vec<(String, Vec<u8>, Vec<u8>)>,
    pub removes: Vec<(String, Vec<u8>)>,
    /// Secondary-index entries: (table, secondary key bytes, primary key
    /// bytes, no_overwrite). `no_overwrite` enforces uniqueness for a
    /// persistent index (spec §4.3).
    pub index_puts: Vec<(String, Vec<u8>, Vec<u8>, bool)>,
    pub index_removes: Vec<(String, Vec<u8>, Vec<u8>)>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.removes.is_empty() && self.index_puts.is_empty() && self.index_removes.is_empty()
    }

    /// Rough byte footprint, used by the auto-resize hook (spec §9).
    pub fn estimated_bytes(&self) -> usize {
        let mut total = 0;
        for (table, k, v) in &self.puts {
            total += table.len() + k.len() + v.len();
        }
        for (table, k) in &self.removes {
            total += table.len() + k.len();
        }
        for (table, k, pk, _) in &self.index_puts {
            total += table.len() + k.len() + pk.len();
        }
        for (table, k, pk) in &self.index_removes {
            total += table.len() + k.len() + pk.len();
        }
        total
    }
}

/// The main (primary-key) table contract a persistent engine must satisfy.
#[async_trait]
pub trait PersistentBackend: Send + Sync + std::fmt::Debug {
    async fn create_table(&self, table: &str) -> Result<()>;
    async fn drop_table(&self, table: &str) -> Result<()>;

    async fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()>;
    async fn remove(&self, table: &str, key: &[u8]) -> Result<()>;
    async fn count(&self, table: &str) -> Result<usize>;
    async fn min_key(&self, table: &str) -> Result<Option<Vec<u8>>>;
    async fn max_key(&self, table: &str) -> Result<Option<Vec<u8>>>;
    async fn truncate(&self, table: &str) -> Result<()>;
    /// Materializes the table in key order; ascending or descending. The
    /// core consumes this as the callback-driven `keyStream`/`valueStream`
    /// of spec §1 by iterating the returned vector.
    async fn scan(&self, table: &str, ascending: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies every write in `batch` atomically (spec §4.5 step 3, §5
    /// "Flushing into the backend is atomic").
    async fn apply_batch(&self, batch: Batch) -> Result<()>;

    /// Negotiates more space per spec §9 "Auto-resize"; a no-op for engines
    /// without a fixed map size (e.g. the in-memory backend).
    async fn request_resize(&self, _additional_bytes: usize) -> Result<()> {
        Ok(())
    }
}

/// Duplicate-sort ordered table contract for a persistent secondary index
/// (spec §4.3): secondary key → primary key, with duplicates allowed unless
/// the index is unique.
#[async_trait]
pub trait PersistentIndexBackend: Send + Sync + std::fmt::Debug {
    async fn put(&self, table: &str, key: &[u8], primary_key: &[u8], no_overwrite: bool) -> Result<()>;
    async fn remove(&self, table: &str, key: &[u8], primary_key: &[u8]) -> Result<()>;
    async fn scan(&self, table: &str, ascending: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    async fn truncate(&self, table: &str) -> Result<()>;
}
