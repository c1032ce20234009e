//! Database handle (spec §6 "External interfaces"): opens the persistent
//! environment, creates and tracks object stores, runs the version-upgrade
//! protocol on [`Database::connect`], and coordinates combined commits.
//!
//! Mirrors the teacher's `Store::new(path, engine_type)` constructor shape
//! (`storage.rs`'s `EngineType`/`Store::new`): [`EngineType`] selects the
//! concrete [`crate::backend::PersistentBackend`] behind every persistent
//! object store, [`Database::open`] builds it once and shares it across
//! every store registered afterward (spec §6 "one native table per object
//! store" -- one physical backend, multiplexed by table name).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

#[cfg(feature = "redb")]
use crate::backend::redb_backend::RedbBackend;
use crate::backend::{Batch, InMemoryBackend, PersistentBackend, PersistentIndexBackend};
use crate::cache::CachedBackend;
use crate::codec::{Codec, JsonCodec};
use crate::combined_transaction::CombinedTransaction;
use crate::config::{DatabaseOptions, DeleteObjectStoreOptions, IndexOptions, ObjectStoreOptions};
use crate::error::{Error, Result};
use crate::object_store::{ObjectStore, ObjectStoreInner};
use crate::transaction::Transaction;
use crate::value::KeyPath;

const META_TABLE: &str = "_meta";
const VERSION_KEY: &[u8] = b"_dbVersion";

/// Selects the concrete persistent engine behind a [`Database`] (spec §1
/// "memory-mapped file engine", kept behind the `PersistentBackend` trait
/// boundary per spec §1 "Out of scope").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineType {
    #[default]
    InMemory,
    #[cfg(feature = "redb")]
    Redb,
}

/// Delegates every [`PersistentBackend`] method to an inner `Arc<dyn
/// PersistentBackend>` -- lets [`CachedBackend`] (generic over a `Sized`
/// backend) wrap a type-erased shared backend for the per-store `enableCache`
/// option (spec §6 `createObjectStore` options; spec §2 "Cached Backend").
#[derive(Clone, Debug)]
struct DynKvBackend(Arc<dyn PersistentBackend>);

#[async_trait]
impl PersistentBackend for DynKvBackend {
    async fn create_table(&self, table: &str) -> Result<()> {
        self.0.create_table(table).await
    }
    async fn drop_table(&self, table: &str) -> Result<()> {
        self.0.drop_table(table).await
    }
    async fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.0.get(table, key).await
    }
    async fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.0.put(table, key, value).await
    }
    async fn remove(&self, table: &str, key: &[u8]) -> Result<()> {
        self.0.remove(table, key).await
    }
    async fn count(&self, table: &str) -> Result<usize> {
        self.0.count(table).await
    }
    async fn min_key(&self, table: &str) -> Result<Option<Vec<u8>>> {
        self.0.min_key(table).await
    }
    async fn max_key(&self, table: &str) -> Result<Option<Vec<u8>>> {
        self.0.max_key(table).await
    }
    async fn truncate(&self, table: &str) -> Result<()> {
        self.0.truncate(table).await
    }
    async fn scan(&self, table: &str, ascending: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.0.scan(table, ascending).await
    }
    async fn apply_batch(&self, batch: Batch) -> Result<()> {
        self.0.apply_batch(batch).await
    }
    async fn request_resize(&self, additional_bytes: usize) -> Result<()> {
        self.0.request_resize(additional_bytes).await
    }
}

struct StoreEntry {
    store: ObjectStore,
    options: ObjectStoreOptions,
}

/// One database: owner of the shared persistent backend, every object store
/// registered against it, and the version-upgrade bookkeeping (spec §6).
pub struct Database {
    dir: PathBuf,
    version: u32,
    options: DatabaseOptions,
    kv_backend: Arc<dyn PersistentBackend>,
    idx_backend: Arc<dyn PersistentIndexBackend>,
    stores: AsyncMutex<HashMap<String, StoreEntry>>,
    pending_deletes: AsyncMutex<Vec<(String, DeleteObjectStoreOptions)>>,
    connected: AtomicBool,
    next_combined_id: AtomicU64,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.dir)
            .field("version", &self.version)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl Database {
    /// Opens (creating if necessary) the database directory at `dir` for
    /// schema `version`, backed by `engine_type`'s persistent engine. Call
    /// [`Database::connect`] afterward to run the version-upgrade protocol
    /// (spec §6 "Version upgrade protocol").
    pub fn open(dir: impl AsRef<Path>, version: u32, engine_type: EngineType, options: DatabaseOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        info!(dir = %dir.display(), version, engine = ?engine_type, "opening database");
        let (kv_backend, idx_backend): (Arc<dyn PersistentBackend>, Arc<dyn PersistentIndexBackend>) = match engine_type {
            EngineType::InMemory => {
                let backend = Arc::new(InMemoryBackend::new());
                (backend.clone(), backend)
            }
            #[cfg(feature = "redb")]
            EngineType::Redb => {
                std::fs::create_dir_all(&dir).map_err(|e| Error::StorageFailure(e.to_string()))?;
                let backend = Arc::new(RedbBackend::open(dir.join("stackdb.redb"))?);
                (backend.clone(), backend)
            }
        };
        Ok(Self {
            dir,
            version,
            options,
            kv_backend,
            idx_backend,
            stores: AsyncMutex::new(HashMap::new()),
            pending_deletes: AsyncMutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            next_combined_id: AtomicU64::new(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Runs the version-upgrade protocol (spec §6): read the persisted
    /// version, apply any queued [`Database::delete_object_store`] calls
    /// whose `upgradeCondition` passes, invoke `onUpgrade` if the schema
    /// version increased, then persist the new version. A second call is a
    /// no-op (SPEC_FULL §6: `onUpgrade` must not re-run on an unchanged
    /// version, made explicit here as "connect runs once").
    pub async fn connect(&self) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let old_version = self.read_version().await?;

        let deletes = std::mem::take(&mut *self.pending_deletes.lock().await);
        for (name, opts) in deletes {
            if opts.upgrade_condition.evaluate(old_version, self.version) {
                self.drop_store_tables(&name, &opts.index_names).await?;
                self.stores.lock().await.remove(&name);
                debug!(store = name, "object store dropped by upgrade protocol");
            }
        }

        if self.version > old_version {
            if let Some(cb) = self.options.on_upgrade.clone() {
                info!(old_version, new_version = self.version, "running upgrade callback");
                cb(old_version, self.version, self);
            }
        }

        self.write_version(self.version).await?;
        info!(old_version, new_version = self.version, "database connected");
        Ok(())
    }

    async fn read_version(&self) -> Result<u32> {
        match self.kv_backend.get(META_TABLE, VERSION_KEY).await? {
            Some(bytes) if bytes.len() == 4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes);
                Ok(u32::from_be_bytes(buf))
            }
            _ => Ok(0),
        }
    }

    async fn write_version(&self, version: u32) -> Result<()> {
        self.kv_backend.put(META_TABLE, VERSION_KEY, &version.to_be_bytes()).await
    }

    async fn drop_store_tables(&self, name: &str, index_names: &[String]) -> Result<()> {
        self.kv_backend.drop_table(name).await?;
        for index_name in index_names {
            let table = format!("_{name}-{index_name}");
            self.idx_backend.truncate(&table).await?;
        }
        Ok(())
    }

    /// Registers a new object store, backfilling it from whatever the
    /// shared backend already holds under `name` (spec §6
    /// `createObjectStore`). Calling this again for an already-registered
    /// name returns the existing handle rather than erroring.
    pub async fn create_object_store(
        &self,
        name: &str,
        options: ObjectStoreOptions,
        codec: Option<Arc<dyn Codec>>,
    ) -> Result<ObjectStore> {
        let mut guard = self.stores.lock().await;
        if let Some(entry) = guard.get(name) {
            return Ok(entry.store.clone());
        }
        let codec = codec.unwrap_or_else(|| Arc::new(JsonCodec));
        let kv_backend = self.store_kv_backend(&options);
        let inner = Arc::new(ObjectStoreInner::new(
            name.to_string(),
            &options,
            codec,
            kv_backend,
            self.idx_backend.clone(),
        ));
        let store = ObjectStore { inner };
        guard.insert(
            name.to_string(),
            StoreEntry {
                store: store.clone(),
                options,
            },
        );
        debug!(store = name, "object store created");
        Ok(store)
    }

    fn store_kv_backend(&self, options: &ObjectStoreOptions) -> Arc<dyn PersistentBackend> {
        if !options.persistent {
            // A private, non-shared backend: never touches the database's
            // shared engine, and its data is gone the moment the store
            // handle is dropped (spec §2 "non-persistent" object store).
            return Arc::new(InMemoryBackend::new());
        }
        if options.enable_cache {
            let capacity = if options.cache_size > 0 { options.cache_size } else { 10_000 };
            return Arc::new(CachedBackend::with_capacity(DynKvBackend(self.kv_backend.clone()), capacity));
        }
        self.kv_backend.clone()
    }

    /// Looks up an already-registered object store by name.
    pub async fn store(&self, name: &str) -> Result<ObjectStore> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.stores
            .lock()
            .await
            .get(name)
            .map(|e| e.store.clone())
            .ok_or_else(|| Error::NoSuchObjectStore(name.to_string()))
    }

    /// Names of every currently registered object store (SPEC_FULL §6
    /// supplemented introspection surface).
    pub async fn store_names(&self) -> Vec<String> {
        self.stores.lock().await.keys().cloned().collect()
    }

    /// Creates a secondary index on an already-registered store (spec §6
    /// `createIndex`), honoring `options.upgrade_condition` only when this
    /// database has already connected (before that, the target version
    /// isn't known yet, so the index is always created).
    pub async fn create_index(&self, store_name: &str, index_name: &str, key_path: KeyPath, options: IndexOptions) -> Result<()> {
        let store = self
            .stores
            .lock()
            .await
            .get(store_name)
            .map(|e| e.store.clone())
            .ok_or_else(|| Error::NoSuchObjectStore(store_name.to_string()))?;
        if self.connected.load(Ordering::SeqCst) {
            let old_version = self.read_version().await?;
            if !options.upgrade_condition.evaluate(old_version, self.version) {
                return Ok(());
            }
        }
        store.create_index(index_name, key_path, options).await
    }

    /// Queues an object store for deletion; actually dropped during the
    /// next [`Database::connect`] run (spec §6 "Version upgrade protocol"
    /// step 2: deletions are schema-migration actions gated on
    /// `upgradeCondition(oldVersion, newVersion)`, not immediate).
    pub async fn delete_object_store(&self, name: &str, options: DeleteObjectStoreOptions) {
        self.pending_deletes.lock().await.push((name.to_string(), options));
    }

    /// Atomically commits several stores' pending transactions together
    /// (spec §4.6, §6 `commitCombined`). `Ok(true)` on atomic success;
    /// `Ok(false)` if any participant didn't qualify and nothing was
    /// applied.
    pub async fn commit_combined(&self, transactions: &[&Transaction]) -> Result<bool> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let id = self.next_combined_id.fetch_add(1, Ordering::SeqCst);
        let mut combined = CombinedTransaction::new(id);
        for txn in transactions {
            combined.add(txn);
        }
        combined.commit().await
    }

    /// Drops every registered store's in-process state. The shared
    /// persistent backend (if any) keeps its data on disk; reopening the
    /// same directory and reconnecting restores every store.
    pub async fn close(&self) {
        self.stores.lock().await.clear();
        self.connected.store(false, Ordering::SeqCst);
        info!(dir = %self.dir.display(), "database closed");
    }

    /// Drops every registered store and truncates its backing table --
    /// unlike [`Database::close`], this removes the data too (spec §6
    /// `destroy()`).
    pub async fn destroy(&self) -> Result<()> {
        let mut guard = self.stores.lock().await;
        for (name, entry) in guard.drain() {
            self.kv_backend.drop_table(&name).await?;
            for index_name in entry.store.index_names().await {
                let table = format!("_{name}-{index_name}");
                self.idx_backend.truncate(&table).await?;
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(dir = %self.dir.display(), "database destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use bytes::Bytes;

    fn pk(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_persists_version() {
        let db = Database::open("/tmp/unused", 3, EngineType::InMemory, DatabaseOptions::default()).unwrap();
        db.connect().await.unwrap();
        assert_eq!(db.read_version().await.unwrap(), 3);
        db.connect().await.unwrap();
        assert_eq!(db.read_version().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn on_upgrade_runs_once_across_repeated_connects() {
        use std::sync::atomic::AtomicUsize;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mut options = DatabaseOptions::default();
        options.on_upgrade = Some(Arc::new(move |_old, _new, _db| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let db = Database::open("/tmp/unused", 1, EngineType::InMemory, options).unwrap();
        db.connect().await.unwrap();
        db.connect().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_object_store_is_idempotent_by_name() {
        let db = Database::open("/tmp/unused", 1, EngineType::InMemory, DatabaseOptions::default()).unwrap();
        let a = db
            .create_object_store("widgets", ObjectStoreOptions { persistent: true, ..Default::default() }, None)
            .await
            .unwrap();
        a.put(pk("x"), Value::Number(1.0)).await.unwrap();
        let b = db
            .create_object_store("widgets", ObjectStoreOptions { persistent: true, ..Default::default() }, None)
            .await
            .unwrap();
        assert_eq!(b.get(&pk("x")).await.unwrap(), Some(Value::Number(1.0)));
    }

    #[tokio::test]
    async fn delete_object_store_is_gated_by_upgrade_condition_at_connect() {
        let db = Database::open("/tmp/unused", 2, EngineType::InMemory, DatabaseOptions::default()).unwrap();
        db.create_object_store("legacy", ObjectStoreOptions { persistent: true, ..Default::default() }, None)
            .await
            .unwrap();
        db.delete_object_store(
            "legacy",
            DeleteObjectStoreOptions {
                upgrade_condition: crate::config::UpgradeCondition::Bool(true),
                index_names: vec![],
            },
        )
        .await;
        db.connect().await.unwrap();
        assert!(db.store_names().await.is_empty());
    }

    #[tokio::test]
    async fn commit_combined_requires_connect() {
        let db = Database::open("/tmp/unused", 1, EngineType::InMemory, DatabaseOptions::default()).unwrap();
        let store = db
            .create_object_store("widgets", ObjectStoreOptions { persistent: true, ..Default::default() }, None)
            .await
            .unwrap();
        let txn = store.transaction().await.unwrap();
        assert!(matches!(db.commit_combined(&[&txn]).await, Err(Error::NotConnected)));
    }
}
