//! Object Store (spec §2, §3, §4.5, §5): owns one native KV table plus its
//! secondary indices, and serializes every transaction/flatten against them
//! through a single lock (spec §5 "a simple FIFO queue that guarantees only
//! one flatten operation runs at a time").
//!
//! The stack of open/committed-but-not-yet-flattened transactions is modeled
//! as a tree of [`Node`]s keyed by [`TxnId`], rooted at the persistent
//! backend. Nodes are never removed once created: a flattened node is
//! tombstoned in place (`flattened = true`, its overlay and index map
//! dropped) so that any older sibling still holding `Parent::Txn(old_id)`
//! keeps working -- reads transparently chase through a flattened node to
//! wherever its data actually landed (spec §9 "Flatten without rewiring").

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::backend::{Batch, PersistentBackend, PersistentIndexBackend};
use crate::codec::Codec;
use crate::config::{IndexOptions, ObjectStoreOptions};
use crate::error::{Error, Result};
use crate::index::{Index, InMemoryIndex, PersistentIndex, TransactionIndex};
use crate::key::PrimaryKey;
use crate::keyrange::KeyRange;
use crate::snapshot::{Position, Snapshot, SnapshotId, SnapshotManager};
use crate::transaction::{Overlay, Transaction, TransactionState, TxnId};
use crate::value::{KeyPath, Value};
use crate::watchdog;

/// Spec §5 resource limit: a stack deeper than this rejects new transactions
/// rather than growing without bound.
pub const MAX_STACK_SIZE: usize = 10;

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Parent {
    Backend,
    Txn(TxnId),
}

#[derive(Clone)]
struct IndexMeta {
    key_path: KeyPath,
    unique: bool,
    multi_entry: bool,
    current: Arc<dyn Index>,
}

#[derive(Debug)]
struct Node {
    parent: Parent,
    state: TransactionState,
    overlay: Overlay,
    indices: HashMap<String, Arc<dyn Index>>,
    is_nested: bool,
    nested_children: Vec<TxnId>,
    committed_child: Option<TxnId>,
    flattened: bool,
    /// Set while this transaction is a participant in a not-yet-resolved
    /// [`crate::combined_transaction::CombinedTransaction`] (spec §4.6):
    /// commit is deferred until the coordinator releases it.
    dependency: Option<u64>,
}

impl Node {
    fn new(parent: Parent, is_nested: bool, indices: HashMap<String, Arc<dyn Index>>) -> Self {
        Self {
            parent,
            state: TransactionState::Open,
            overlay: Overlay::default(),
            indices,
            is_nested,
            nested_children: Vec::new(),
            committed_child: None,
            flattened: false,
            dependency: None,
        }
    }
}

struct Inner {
    nodes: HashMap<TxnId, Node>,
    next_id: TxnId,
    stack: VecDeque<TxnId>,
    current_top: Parent,
    root_committed_child: Option<TxnId>,
    index_metas: HashMap<String, IndexMeta>,
    snapshots: SnapshotManager,
}

impl Inner {
    fn index_snapshot(&self) -> HashMap<String, Arc<dyn Index>> {
        self.index_metas.iter().map(|(k, v)| (k.clone(), v.current.clone())).collect()
    }
}

/// Internal, shared state behind every [`ObjectStore`]/[`Transaction`]/
/// [`Snapshot`] handle for one store.
pub struct ObjectStoreInner {
    pub(crate) name: String,
    persistent: bool,
    codec: Arc<dyn Codec>,
    kv_backend: Arc<dyn PersistentBackend>,
    idx_backend: Arc<dyn PersistentIndexBackend>,
    inner: AsyncMutex<Inner>,
}

impl std::fmt::Debug for ObjectStoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreInner").field("name", &self.name).finish()
    }
}

impl ObjectStoreInner {
    pub(crate) fn new(
        name: String,
        options: &ObjectStoreOptions,
        codec: Arc<dyn Codec>,
        kv_backend: Arc<dyn PersistentBackend>,
        idx_backend: Arc<dyn PersistentIndexBackend>,
    ) -> Self {
        Self {
            name,
            persistent: options.persistent,
            codec,
            kv_backend,
            idx_backend,
            inner: AsyncMutex::new(Inner {
                nodes: HashMap::new(),
                next_id: 1,
                stack: VecDeque::new(),
                current_top: Parent::Backend,
                root_committed_child: None,
                index_metas: HashMap::new(),
                snapshots: SnapshotManager::default(),
            }),
        }
    }

    pub(crate) fn table(&self) -> &str {
        &self.name
    }

    // ---- index administration (spec §4.2, §6) ----------------------------

    pub(crate) async fn create_index(
        self: &Arc<Self>,
        index_name: &str,
        key_path: KeyPath,
        options: &IndexOptions,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.index_metas.contains_key(index_name) {
            return Ok(());
        }
        let index: Arc<dyn Index> = if self.persistent {
            Arc::new(PersistentIndex::new(
                &self.name,
                index_name,
                key_path.clone(),
                options.unique,
                options.multi_entry,
                self.idx_backend.clone(),
            ))
        } else {
            Arc::new(InMemoryIndex::new(index_name, key_path.clone(), options.unique, options.multi_entry))
        };

        // Backfill from whatever is currently committed to the backend
        // (spec §6 version-upgrade protocol: a freshly created index is
        // populated from existing records).
        if self.persistent {
            for (raw_key, raw_value) in self.kv_backend.scan(&self.name, true).await? {
                let value = self.codec.decode(&raw_value)?;
                let pk = PrimaryKey::from(raw_key);
                index.put(&pk, Some(&value), None).await?;
            }
        }

        guard.index_metas.insert(
            index_name.to_string(),
            IndexMeta {
                key_path,
                unique: options.unique,
                multi_entry: options.multi_entry,
                current: index,
            },
        );
        Ok(())
    }

    pub(crate) async fn delete_index(&self, index_name: &str) -> Result<()> {
        self.inner.lock().await.index_metas.remove(index_name);
        Ok(())
    }

    pub(crate) async fn index_names(&self) -> Vec<String> {
        self.inner.lock().await.index_metas.keys().cloned().collect()
    }

    // ---- transaction lifecycle --------------------------------------------

    pub(crate) async fn begin_transaction(self: &Arc<Self>) -> Result<TxnId> {
        let mut guard = self.inner.lock().await;
        if guard.stack.len() >= MAX_STACK_SIZE {
            return Err(Error::StackOverflow(MAX_STACK_SIZE));
        }
        let parent = guard.current_top;
        let indices = match parent {
            Parent::Backend => guard.index_snapshot(),
            Parent::Txn(pid) => guard
                .nodes
                .get(&pid)
                .ok_or(Error::Closed)?
                .indices
                .clone(),
        };
        let wrapped = wrap_indices(&guard, indices);
        let id = guard.next_id;
        guard.next_id += 1;
        guard.nodes.insert(id, Node::new(parent, false, wrapped));
        drop(guard);
        watchdog::watch(self.clone(), id, WATCHDOG_TIMEOUT);
        debug!(store = %self.name, txn = id, "transaction opened");
        Ok(id)
    }

    pub(crate) async fn begin_nested(self: &Arc<Self>, parent_id: TxnId) -> Result<TxnId> {
        let mut guard = self.inner.lock().await;
        let parent_indices = {
            let parent_node = guard.nodes.get(&parent_id).ok_or(Error::Closed)?;
            if !matches!(parent_node.state, TransactionState::Open | TransactionState::Nested) {
                return Err(Error::Closed);
            }
            parent_node.indices.clone()
        };
        let wrapped = wrap_indices(&guard, parent_indices);
        let id = guard.next_id;
        guard.next_id += 1;
        guard.nodes.insert(id, Node::new(Parent::Txn(parent_id), true, wrapped));
        if let Some(p) = guard.nodes.get_mut(&parent_id) {
            p.nested_children.push(id);
            p.state = TransactionState::Nested;
        }
        drop(guard);
        watchdog::watch(self.clone(), id, WATCHDOG_TIMEOUT);
        Ok(id)
    }

    pub(crate) async fn transaction_state(&self, id: TxnId) -> TransactionState {
        self.inner
            .lock()
            .await
            .nodes
            .get(&id)
            .map(|n| n.state)
            .unwrap_or(TransactionState::Aborted)
    }

    pub(crate) async fn transaction_get(&self, id: TxnId, key: &PrimaryKey) -> Result<Option<Value>> {
        let guard = self.inner.lock().await;
        let node = guard.nodes.get(&id).ok_or(Error::Closed)?;
        if let Some(hit) = node.overlay.get(key) {
            return Ok(hit.cloned());
        }
        let start = node.parent;
        self.effective_get_locked(&guard, start, key).await
    }

    pub(crate) async fn transaction_put(&self, id: TxnId, key: PrimaryKey, value: Value) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let old = self.read_locked(&guard, id, &key).await?;
        let node = guard.nodes.get_mut(&id).ok_or(Error::Closed)?;
        if !node.state.is_writable() {
            return Err(Error::Closed);
        }
        let indices = node.indices.clone();
        node.overlay.put(key.clone(), value.clone());
        drop(guard);
        for index in indices.values() {
            index.put(&key, Some(&value), old.as_ref()).await?;
        }
        Ok(())
    }

    pub(crate) async fn transaction_remove(&self, id: TxnId, key: &PrimaryKey) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let old = self.read_locked(&guard, id, key).await?;
        let node = guard.nodes.get_mut(&id).ok_or(Error::Closed)?;
        if !node.state.is_writable() {
            return Err(Error::Closed);
        }
        let indices = node.indices.clone();
        node.overlay.remove(key.clone());
        drop(guard);
        if let Some(old) = &old {
            for index in indices.values() {
                index.remove(key, Some(old)).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn transaction_truncate(&self, id: TxnId) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let node = guard.nodes.get_mut(&id).ok_or(Error::Closed)?;
        if !node.state.is_writable() {
            return Err(Error::Closed);
        }
        node.overlay.truncate();
        let indices: Vec<Arc<dyn Index>> = node.indices.values().cloned().collect();
        drop(guard);
        for index in indices {
            index.truncate().await?;
        }
        Ok(())
    }

    pub(crate) async fn transaction_index_keys(
        &self,
        id: TxnId,
        index_name: &str,
        query: &KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<PrimaryKey>> {
        let guard = self.inner.lock().await;
        let node = guard.nodes.get(&id).ok_or(Error::Closed)?;
        let index = node.indices.get(index_name).ok_or_else(|| Error::NoSuchIndex(index_name.to_string()))?.clone();
        drop(guard);
        index.keys(query, limit).await
    }

    /// Reads `key` as it stands inside transaction `id` right now (overlay
    /// first, parent chain after), used to compute the `old_value` a write
    /// must pass to `Index::put`/`remove`. `guard` must already be locked.
    async fn read_locked(&self, guard: &Inner, id: TxnId, key: &PrimaryKey) -> Result<Option<Value>> {
        let node = guard.nodes.get(&id).ok_or(Error::Closed)?;
        if let Some(hit) = node.overlay.get(key) {
            return Ok(hit.cloned());
        }
        let start = node.parent;
        self.effective_get_locked(guard, start, key).await
    }

    /// Walks `start` down through the node chain (transparently skipping
    /// flattened nodes) to the backend (spec §4.5 read order). Takes an
    /// already-acquired borrow of `Inner`: the object store's single lock is
    /// held for the whole call, including backend awaits (spec §5 "a simple
    /// FIFO queue").
    async fn effective_get_locked(&self, guard: &Inner, start: Parent, key: &PrimaryKey) -> Result<Option<Value>> {
        let mut cur = start;
        loop {
            match cur {
                Parent::Backend => {
                    let Some(raw) = self.kv_backend.get(&self.name, key).await? else {
                        return Ok(None);
                    };
                    return Ok(Some(self.codec.decode(&raw)?));
                }
                Parent::Txn(id) => {
                    let node = guard.nodes.get(&id).ok_or(Error::Closed)?;
                    if node.flattened {
                        cur = node.parent;
                        continue;
                    }
                    if let Some(hit) = node.overlay.get(key) {
                        return Ok(hit.cloned());
                    }
                    cur = node.parent;
                }
            }
        }
    }

    /// Enumerates every live key visible at `position`, used only by
    /// truncate-time snapshot freezing (spec §9 "single enumeration").
    /// Boxed because it recurses through an `async fn`. `guard` must already
    /// be locked.
    fn scan_all_keys_locked<'a>(
        &'a self,
        guard: &'a Inner,
        position: Parent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<PrimaryKey>>> + Send + 'a>> {
        Box::pin(async move {
            match position {
                Parent::Backend => Ok(self
                    .kv_backend
                    .scan(&self.name, true)
                    .await?
                    .into_iter()
                    .map(|(k, _)| PrimaryKey::from(k))
                    .collect()),
                Parent::Txn(id) => {
                    let node = guard.nodes.get(&id).ok_or(Error::Closed)?;
                    if node.flattened {
                        return self.scan_all_keys_locked(guard, node.parent).await;
                    }
                    let mut keys: std::collections::BTreeSet<PrimaryKey> = if node.overlay.truncated {
                        std::collections::BTreeSet::new()
                    } else {
                        self.scan_all_keys_locked(guard, node.parent).await?.into_iter().collect()
                    };
                    for k in &node.overlay.removed {
                        keys.remove(k);
                    }
                    for k in node.overlay.modified.keys() {
                        keys.insert(k.clone());
                    }
                    Ok(keys.into_iter().collect())
                }
            }
        })
    }

    // ---- commit / abort -----------------------------------------------------

    pub(crate) async fn commit_transaction(self: &Arc<Self>, id: TxnId) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let node = guard.nodes.get(&id).ok_or(Error::Closed)?;
        if node.dependency.is_some() {
            return Err(Error::UnsupportedOperation(
                "transaction is a combined-transaction participant; commit through the coordinator".into(),
            ));
        }
        if node.is_nested {
            return self.commit_nested(&mut guard, id);
        }
        match node.state {
            TransactionState::Nested => return Err(Error::Closed),
            TransactionState::Open => {}
            _ => return Err(Error::Closed),
        }

        let parent = node.parent;
        let already_committed = match parent {
            Parent::Backend => guard.root_committed_child,
            Parent::Txn(pid) => guard.nodes.get(&pid).and_then(|p| p.committed_child),
        };
        if already_committed.is_some() {
            if let Some(n) = guard.nodes.get_mut(&id) {
                n.state = TransactionState::Conflicted;
            }
            return Ok(false);
        }

        match parent {
            Parent::Backend => guard.root_committed_child = Some(id),
            Parent::Txn(pid) => {
                if let Some(p) = guard.nodes.get_mut(&pid) {
                    p.committed_child = Some(id);
                }
            }
        }
        if let Some(n) = guard.nodes.get_mut(&id) {
            n.state = TransactionState::Committed;
        }
        if guard.current_top == parent {
            guard.current_top = Parent::Txn(id);
        }
        guard.stack.push_back(id);
        self.try_flatten(&mut guard).await?;
        Ok(true)
    }

    fn commit_nested(&self, guard: &mut Inner, id: TxnId) -> Result<bool> {
        let (outer_id, overlay, indices) = {
            let node = guard.nodes.get(&id).ok_or(Error::Closed)?;
            if node.state != TransactionState::Open {
                return Err(Error::Closed);
            }
            let Parent::Txn(outer_id) = node.parent else {
                return Err(Error::Closed);
            };
            (outer_id, node.overlay.clone(), node.indices.clone())
        };
        {
            let outer = guard.nodes.get_mut(&outer_id).ok_or(Error::Closed)?;
            outer.overlay.merge_from(&overlay);
            outer.indices = indices;
        }
        if let Some(node) = guard.nodes.get_mut(&id) {
            node.state = TransactionState::Committed;
            node.flattened = true;
            node.overlay = Overlay::default();
            node.indices.clear();
        }
        if let Some(outer) = guard.nodes.get_mut(&outer_id) {
            outer.nested_children.retain(|c| *c != id);
            if outer.nested_children.is_empty() {
                outer.state = TransactionState::Open;
            }
        }
        Ok(true)
    }

    pub(crate) async fn abort_transaction(&self, id: TxnId) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let is_nested = {
            let node = guard.nodes.get_mut(&id).ok_or(Error::Closed)?;
            node.state = TransactionState::Aborted;
            node.overlay = Overlay::default();
            node.indices.clear();
            node.is_nested
        };
        if is_nested {
            let Parent::Txn(outer_id) = guard.nodes.get(&id).map(|n| n.parent).unwrap_or(Parent::Backend) else {
                return Ok(());
            };
            if let Some(outer) = guard.nodes.get_mut(&outer_id) {
                outer.nested_children.retain(|c| *c != id);
                if outer.nested_children.is_empty() {
                    outer.state = TransactionState::Open;
                }
            }
        }
        Ok(())
    }

    /// Flattens every eligible entry at the front of the stack, in order
    /// (spec §4.5 commit protocol step 2, §5 FIFO serializer).
    async fn try_flatten(self: &Arc<Self>, guard: &mut Inner) -> Result<()> {
        loop {
            let Some(&front_id) = guard.stack.front() else {
                break;
            };
            if !self.flatten_eligible(guard, front_id) {
                break;
            }
            self.flatten_one(guard, front_id).await?;
            guard.stack.pop_front();
        }
        Ok(())
    }

    /// Only a combined-transaction dependency can hold a committed node back
    /// from flattening: at most one child of any given parent ever reaches
    /// Committed (the `committed_child` slot enforces that), so the stack's
    /// FIFO order already guarantees every node ahead of `id` is either
    /// flattened or, transitively, blocked on the same kind of dependency.
    fn flatten_eligible(&self, guard: &Inner, id: TxnId) -> bool {
        guard.nodes.get(&id).map(|n| n.dependency.is_none()).unwrap_or(false)
    }

    /// Resolves `parent`, chasing through already-flattened nodes, to either
    /// the backend or the nearest live node.
    fn chase(&self, guard: &Inner, parent: Parent) -> Parent {
        let mut cur = parent;
        while let Parent::Txn(id) = cur {
            match guard.nodes.get(&id) {
                Some(n) if n.flattened => cur = n.parent,
                _ => break,
            }
        }
        cur
    }

    async fn flatten_one(self: &Arc<Self>, guard: &mut Inner, id: TxnId) -> Result<()> {
        let (overlay, indices, node_parent) = {
            let node = guard.nodes.get(&id).ok_or(Error::Closed)?;
            (node.overlay.clone(), node.indices.clone(), node.parent)
        };
        let target = self.chase(guard, node_parent);

        // Snapshot freezing happens against the pre-merge state at
        // `node_parent` (spec §4.7), before that state's data is overwritten.
        self.apply_to_snapshots(guard, Parent::Txn(id), node_parent, &overlay, target).await?;

        match target {
            Parent::Backend => {
                self.flatten_to_backend(guard, node_parent, &overlay).await?;
                // Persistent indices are written through directly (spec §4.3):
                // `index_metas[name].current` stays the original `PersistentIndex`,
                // so it keeps being the backend-durable base for every later
                // transaction instead of an ever-deepening in-memory overlay.
                if !self.persistent {
                    for (name, idx) in indices {
                        if let Some(meta) = guard.index_metas.get_mut(&name) {
                            meta.current = idx;
                        }
                    }
                }
            }
            Parent::Txn(target_id) => {
                if let Some(t) = guard.nodes.get_mut(&target_id) {
                    t.overlay.merge_from(&overlay);
                    t.indices = indices;
                }
            }
        }

        if guard.current_top == Parent::Txn(id) {
            guard.current_top = target;
        }
        if let Some(node) = guard.nodes.get_mut(&id) {
            node.flattened = true;
            node.overlay = Overlay::default();
            node.indices.clear();
        }
        Ok(())
    }

    async fn flatten_to_backend(&self, guard: &Inner, node_parent: Parent, overlay: &Overlay) -> Result<()> {
        // Index deltas are read and replayed against the pre-commit state
        // before the KV batch lands, so `effective_get_locked` below still
        // sees the old value for each touched key (spec §4.3: transactions
        // encode into a batch of (key,value) puts/removes at commit time).
        if self.persistent {
            self.replay_index_deltas(guard, node_parent, overlay).await?;
        }
        let mut batch = Batch::default();
        if overlay.truncated {
            self.kv_backend.truncate(&self.name).await?;
        }
        for (k, v) in &overlay.modified {
            let encoded = self.codec.encode(v)?;
            batch.puts.push((self.name.clone(), k.to_vec(), encoded));
        }
        for k in &overlay.removed {
            batch.removes.push((self.name.clone(), k.to_vec()));
        }
        if !batch.is_empty() {
            self.kv_backend.apply_batch(batch).await?;
        }
        Ok(())
    }

    /// Mirrors one transaction's committed KV deltas into every index's own
    /// `PersistentIndex` backend table, the way `PersistentIndex::put`/
    /// `remove` already do for a single non-transactional write.
    async fn replay_index_deltas(&self, guard: &Inner, node_parent: Parent, overlay: &Overlay) -> Result<()> {
        for meta in guard.index_metas.values() {
            let index = &meta.current;
            if overlay.truncated {
                index.truncate().await?;
            }
            for key in &overlay.removed {
                let old = self.effective_get_locked(guard, node_parent, key).await?;
                index.remove(key, old.as_ref()).await?;
            }
            for (key, value) in &overlay.modified {
                let old = self.effective_get_locked(guard, node_parent, key).await?;
                index.put(key, Some(value), old.as_ref()).await?;
            }
        }
        Ok(())
    }

    async fn apply_to_snapshots(
        &self,
        guard: &mut Inner,
        node_position: Parent,
        parent_position: Parent,
        overlay: &Overlay,
        target: Parent,
    ) -> Result<()> {
        let ids = guard.snapshots.at(&to_snapshot_position(node_position));
        if ids.is_empty() {
            return Ok(());
        }
        if overlay.truncated {
            let all_keys = self.scan_all_keys_locked(guard, parent_position).await?;
            for key in all_keys {
                if overlay.removed.contains(&key) || overlay.modified.contains_key(&key) {
                    continue;
                }
                let old = self.effective_get_locked(guard, parent_position, &key).await?;
                for id in &ids {
                    guard.snapshots.record_if_absent(*id, key.clone(), old.clone());
                }
            }
        }
        for key in &overlay.removed {
            let old = self.effective_get_locked(guard, parent_position, key).await?;
            for id in &ids {
                guard.snapshots.record_if_absent(*id, key.clone(), old.clone());
            }
        }
        for key in overlay.modified.keys() {
            let old = self.effective_get_locked(guard, parent_position, key).await?;
            for id in &ids {
                guard.snapshots.record_if_absent(*id, key.clone(), old.clone());
            }
        }
        for id in ids {
            guard.snapshots.rebind(id, to_snapshot_position(target));
        }
        Ok(())
    }

    // ---- combined-transaction support (spec §4.6) --------------------------

    pub(crate) fn backend_identity(&self) -> usize {
        Arc::as_ptr(&self.kv_backend) as *const () as usize
    }

    /// Only supports the common case where `id`'s parent is already the
    /// backend and it would flatten immediately (no blocking siblings).
    /// A fuller implementation would let a combined transaction defer
    /// through an arbitrary-depth chain; this crate handles the case spec
    /// seed scenario S5 exercises.
    pub(crate) async fn prepare_combined(&self, id: TxnId) -> Result<(Batch, Vec<(String, Arc<dyn Index>)>)> {
        let guard = self.inner.lock().await;
        let node = guard.nodes.get(&id).ok_or(Error::Closed)?;
        if node.state != TransactionState::Open {
            return Err(Error::Closed);
        }
        if node.parent != Parent::Backend {
            return Err(Error::UnsupportedOperation(
                "combined transaction participant must be rooted directly on the backend".into(),
            ));
        }
        if !self.flatten_eligible(&guard, id) {
            return Err(Error::UnsupportedOperation(
                "combined transaction participant has an open sibling blocking it".into(),
            ));
        }
        let mut batch = Batch::default();
        if node.overlay.truncated {
            // Truncation inside a combined transaction degenerates to a
            // plain delete-all applied as part of the shared batch.
            for (k, _) in self.kv_backend.scan(&self.name, true).await? {
                batch.removes.push((self.name.clone(), k));
            }
        }
        for (k, v) in &node.overlay.modified {
            batch.puts.push((self.name.clone(), k.to_vec(), self.codec.encode(v)?));
        }
        for k in &node.overlay.removed {
            batch.removes.push((self.name.clone(), k.to_vec()));
        }
        let indices: Vec<(String, Arc<dyn Index>)> = node.indices.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok((batch, indices))
    }

    /// Applies a batch built by [`Self::prepare_combined`] (possibly merged
    /// with another participant's on the same backend) directly to this
    /// store's backend, bypassing the node tree entirely -- used by
    /// [`crate::combined_transaction::CombinedTransaction`].
    pub(crate) async fn apply_combined_batch(&self, batch: Batch) -> Result<()> {
        self.kv_backend.apply_batch(batch).await
    }

    pub(crate) async fn mark_dependency(&self, id: TxnId, dep: u64) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard.nodes.get_mut(&id).ok_or(Error::Closed)?.dependency = Some(dep);
        Ok(())
    }

    /// Releases a dependency set by [`Self::mark_dependency`] without
    /// otherwise touching the transaction -- used when a combined commit
    /// turns out not to apply (spec §4.6: rejection before anything was
    /// written leaves every participant exactly as it was).
    pub(crate) async fn clear_dependency(&self, id: TxnId) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(node) = guard.nodes.get_mut(&id) {
            node.dependency = None;
        }
        Ok(())
    }

    /// Finalizes a combined-transaction participant after the coordinator's
    /// shared batch has been applied: clear the dependency, mark committed,
    /// adopt the (already-current) indices as the store's new base.
    pub(crate) async fn finalize_combined(&self, id: TxnId) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let indices = {
            let node = guard.nodes.get_mut(&id).ok_or(Error::Closed)?;
            node.dependency = None;
            node.state = TransactionState::Committed;
            node.flattened = true;
            let indices = node.indices.clone();
            node.overlay = Overlay::default();
            node.indices.clear();
            indices
        };
        guard.root_committed_child = Some(id);
        for (name, idx) in indices {
            if let Some(meta) = guard.index_metas.get_mut(&name) {
                meta.current = idx;
            }
        }
        if guard.current_top == Parent::Txn(id) {
            guard.current_top = Parent::Backend;
        }
        Ok(())
    }

    pub(crate) async fn abort_combined(&self, id: TxnId) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(node) = guard.nodes.get_mut(&id) {
            node.dependency = None;
            node.state = TransactionState::Aborted;
            node.overlay = Overlay::default();
            node.indices.clear();
        }
        Ok(())
    }

    // ---- snapshots (spec §4.7) ----------------------------------------------

    pub(crate) async fn open_snapshot(&self) -> SnapshotId {
        let mut guard = self.inner.lock().await;
        let position = to_snapshot_position(guard.current_top);
        guard.snapshots.register(position)
    }

    pub(crate) async fn snapshot_get(&self, snap: SnapshotId, key: &PrimaryKey) -> Result<Option<Value>> {
        let guard = self.inner.lock().await;
        if let Some(hit) = guard.snapshots.get_recorded(snap, key) {
            return Ok(hit);
        }
        let position = guard.snapshots.position(snap).ok_or(Error::Closed)?;
        self.effective_get_locked(&guard, from_snapshot_position(position), key).await
    }

    pub(crate) async fn close_snapshot(&self, snap: SnapshotId) {
        self.inner.lock().await.snapshots.drop_snapshot(snap);
    }

    /// Live key count at the current committed position (spec §6
    /// `count`/supplemented `is_empty`).
    pub(crate) async fn count(&self) -> Result<usize> {
        let guard = self.inner.lock().await;
        let top = guard.current_top;
        Ok(self.scan_all_keys_locked(&guard, top).await?.len())
    }

    /// Every live primary key at the current committed position, in
    /// ascending order (spec §6 `keys(query,limit)` with no secondary
    /// index -- the primary-key space itself).
    pub(crate) async fn primary_keys(&self, limit: Option<usize>) -> Result<Vec<PrimaryKey>> {
        let guard = self.inner.lock().await;
        let top = guard.current_top;
        let mut keys = self.scan_all_keys_locked(&guard, top).await?;
        if let Some(limit) = limit {
            keys.truncate(limit);
        }
        Ok(keys)
    }
}

fn wrap_indices(guard: &Inner, parent_indices: HashMap<String, Arc<dyn Index>>) -> HashMap<String, Arc<dyn Index>> {
    parent_indices
        .into_iter()
        .map(|(name, parent)| {
            let meta = guard.index_metas.get(&name);
            let (key_path, unique, multi_entry) = meta
                .map(|m| (m.key_path.clone(), m.unique, m.multi_entry))
                .unwrap_or((KeyPath::Single(name.clone()), false, false));
            let wrapped: Arc<dyn Index> = Arc::new(TransactionIndex::new(parent, key_path, unique, multi_entry));
            (name, wrapped)
        })
        .collect()
}

fn to_snapshot_position(p: Parent) -> Position {
    match p {
        Parent::Backend => Position::Backend,
        Parent::Txn(id) => Position::Txn(id),
    }
}

fn from_snapshot_position(p: Position) -> Parent {
    match p {
        Position::Backend => Parent::Backend,
        Position::Txn(id) => Parent::Txn(id),
    }
}

/// Public handle to one object store (spec §2 "Object Store").
#[derive(Clone)]
pub struct ObjectStore {
    pub(crate) inner: Arc<ObjectStoreInner>,
}

impl ObjectStore {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn create_index(&self, name: &str, key_path: KeyPath, options: IndexOptions) -> Result<()> {
        self.inner.create_index(name, key_path, &options).await
    }

    pub async fn delete_index(&self, name: &str) -> Result<()> {
        self.inner.delete_index(name).await
    }

    /// Names of every index currently defined on this store.
    pub async fn index_names(&self) -> Vec<String> {
        self.inner.index_names().await
    }

    pub async fn transaction(&self) -> Result<Transaction> {
        let id = self.inner.begin_transaction().await?;
        Ok(Transaction {
            id,
            store: self.inner.clone(),
        })
    }

    /// Convenience read with no explicit transaction: reads the store's
    /// current committed state directly.
    pub async fn get(&self, key: &PrimaryKey) -> Result<Option<Value>> {
        let guard = self.inner.inner.lock().await;
        let top = guard.current_top;
        self.inner.effective_get_locked(&guard, top, key).await
    }

    /// Convenience write: opens a transaction, writes, commits it.
    pub async fn put(&self, key: PrimaryKey, value: Value) -> Result<()> {
        let txn = self.transaction().await?;
        txn.put(key, value).await?;
        if !txn.commit().await? {
            return Err(Error::Conflict);
        }
        Ok(())
    }

    pub async fn remove(&self, key: &PrimaryKey) -> Result<()> {
        let txn = self.transaction().await?;
        txn.remove(key).await?;
        if !txn.commit().await? {
            return Err(Error::Conflict);
        }
        Ok(())
    }

    pub async fn truncate(&self) -> Result<()> {
        let txn = self.transaction().await?;
        txn.truncate().await?;
        if !txn.commit().await? {
            return Err(Error::Conflict);
        }
        Ok(())
    }

    pub async fn keys(&self, index: &str, query: &KeyRange, limit: Option<usize>) -> Result<Vec<PrimaryKey>> {
        let idx = self.index_handle(index).await?;
        idx.keys(query, limit).await
    }

    /// Looks up a named index's current handle, for callers (e.g.
    /// [`crate::query::Query`]) that need to drive it directly.
    pub async fn index_handle(&self, index: &str) -> Result<Arc<dyn Index>> {
        let indices = self.inner.inner.lock().await.index_snapshot();
        indices.get(index).cloned().ok_or_else(|| Error::NoSuchIndex(index.to_string()))
    }

    pub async fn snapshot(&self) -> Snapshot {
        let id = self.inner.open_snapshot().await;
        Snapshot {
            id,
            store: self.inner.clone(),
        }
    }

    /// Live key count (spec §6 `count`).
    pub async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    /// Supplemented (SPEC_FULL §6): trivial wrapper over [`Self::count`].
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.inner.count().await? == 0)
    }

    /// Every live primary key, in ascending order, at most `limit` of them
    /// (spec §6 `keys(query,limit)` over the primary-key space).
    pub async fn primary_keys(&self, limit: Option<usize>) -> Result<Vec<PrimaryKey>> {
        self.inner.primary_keys(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::codec::JsonCodec;
    use bytes::Bytes;

    fn make_store(persistent: bool) -> ObjectStore {
        let backend = Arc::new(InMemoryBackend::new());
        let options = ObjectStoreOptions {
            persistent,
            ..Default::default()
        };
        let inner = Arc::new(ObjectStoreInner::new(
            "widgets".into(),
            &options,
            Arc::new(JsonCodec),
            backend.clone(),
            backend,
        ));
        ObjectStore { inner }
    }

    fn pk(s: &str) -> PrimaryKey {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn read_your_own_writes_before_commit() {
        let store = make_store(true);
        let txn = store.transaction().await.unwrap();
        txn.put(pk("a"), Value::Str("1".into())).await.unwrap();
        assert_eq!(txn.get(&pk("a")).await.unwrap(), Some(Value::Str("1".into())));
        assert_eq!(store.get(&pk("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn commit_makes_writes_visible_and_flattens() {
        let store = make_store(true);
        let txn = store.transaction().await.unwrap();
        txn.put(pk("a"), Value::Str("1".into())).await.unwrap();
        assert!(txn.commit().await.unwrap());
        assert_eq!(store.get(&pk("a")).await.unwrap(), Some(Value::Str("1".into())));
    }

    #[tokio::test]
    async fn first_committer_wins_second_sibling_conflicts() {
        let store = make_store(true);
        let t1 = store.transaction().await.unwrap();
        let t2 = store.transaction().await.unwrap();
        t1.put(pk("a"), Value::Str("from-t1".into())).await.unwrap();
        t2.put(pk("a"), Value::Str("from-t2".into())).await.unwrap();
        assert!(t1.commit().await.unwrap());
        assert!(!t2.commit().await.unwrap());
        assert_eq!(store.get(&pk("a")).await.unwrap(), Some(Value::Str("from-t1".into())));
    }

    #[tokio::test]
    async fn unique_index_conflict_surfaces_as_constraint_violation() {
        let store = make_store(false);
        store
            .create_index("byVal", KeyPath::Single("val".into()), IndexOptions {
                unique: true,
                multi_entry: false,
                upgrade_condition: Default::default(),
            })
            .await
            .unwrap();
        let obj = |n: f64| Value::Object([("val".to_string(), Value::Number(n))].into_iter().collect());
        store.put(pk("k1"), obj(1.0)).await.unwrap();
        let err = store.put(pk("k2"), obj(1.0)).await.unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn persistent_index_survives_past_the_committing_transaction() {
        let store = make_store(true);
        store
            .create_index("byVal", KeyPath::Single("val".into()), IndexOptions {
                unique: true,
                multi_entry: false,
                upgrade_condition: Default::default(),
            })
            .await
            .unwrap();
        let obj = |n: f64| Value::Object([("val".to_string(), Value::Number(n))].into_iter().collect());

        store.put(pk("k1"), obj(1.0)).await.unwrap();
        // A second committed transaction wraps a fresh `TransactionIndex` over
        // whatever `index_metas["byVal"].current` now is; if that slot had
        // been swapped to the first transaction's in-memory overlay instead
        // of staying the backend-durable `PersistentIndex`, this duplicate
        // would slip through uncaught (the bug this test guards against).
        let err = store.put(pk("k2"), obj(1.0)).await.unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { .. }));

        let idx = store.index_handle("byVal").await.unwrap();
        let hits = idx.keys(&KeyRange::only(crate::key::SecondaryKey::Number(1.0)), None).await.unwrap();
        assert_eq!(hits, vec![pk("k1")]);
    }

    #[tokio::test]
    async fn nested_transaction_merges_into_outer_on_commit() {
        let store = make_store(true);
        let outer = store.transaction().await.unwrap();
        outer.put(pk("a"), Value::Str("outer".into())).await.unwrap();
        let nested = outer.begin_nested().await.unwrap();
        nested.put(pk("b"), Value::Str("nested".into())).await.unwrap();
        assert!(nested.commit().await.unwrap());
        assert_eq!(outer.get(&pk("b")).await.unwrap(), Some(Value::Str("nested".into())));
        assert!(outer.commit().await.unwrap());
        assert_eq!(store.get(&pk("a")).await.unwrap(), Some(Value::Str("outer".into())));
        assert_eq!(store.get(&pk("b")).await.unwrap(), Some(Value::Str("nested".into())));
    }

    #[tokio::test]
    async fn truncate_inside_transaction_hides_prior_writes() {
        let store = make_store(true);
        store.put(pk("a"), Value::Str("x".into())).await.unwrap();
        let txn = store.transaction().await.unwrap();
        txn.truncate().await.unwrap();
        assert_eq!(txn.get(&pk("a")).await.unwrap(), None);
        assert!(txn.commit().await.unwrap());
        assert_eq!(store.get(&pk("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn snapshot_of_a_truncate_still_sees_old_values() {
        let store = make_store(true);
        store.put(pk("a"), Value::Str("x".into())).await.unwrap();
        let snap = store.snapshot().await;
        let txn = store.transaction().await.unwrap();
        txn.truncate().await.unwrap();
        assert!(txn.commit().await.unwrap());
        assert_eq!(store.get(&pk("a")).await.unwrap(), None);
        assert_eq!(snap.get(&pk("a")).await.unwrap(), Some(Value::Str("x".into())));
    }
}
