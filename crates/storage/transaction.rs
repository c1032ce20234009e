//! Transaction (spec §4.5): a mutable overlay over a parent state -- either
//! another transaction or the object store's persistent backend -- carrying
//! its own modified/removed/truncated bookkeeping and one
//! [`crate::index::TransactionIndex`] per index on the owning store.
//!
//! `Transaction` itself is a thin, cloneable handle; all of its actual state
//! lives in the owning [`crate::object_store::ObjectStoreInner`]'s node
//! table, guarded by a single lock that doubles as the FIFO serializer spec
//! §5 calls for.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::key::PrimaryKey;
use crate::keyrange::KeyRange;
use crate::object_store::ObjectStoreInner;
use crate::value::Value;

pub type TxnId = u64;

/// The write set a Transaction accumulates (spec §3 table, §4.5). Shared by
/// top-level transactions, nested transactions, and -- via the same
/// `merge_from` -- the flatten/nested-commit code path in `object_store.rs`.
#[derive(Debug, Default, Clone)]
pub(crate) struct Overlay {
    pub modified: BTreeMap<PrimaryKey, Value>,
    pub removed: BTreeSet<PrimaryKey>,
    pub truncated: bool,
}

impl Overlay {
    pub(crate) fn put(&mut self, key: PrimaryKey, value: Value) {
        self.removed.remove(&key);
        self.modified.insert(key, value);
    }

    pub(crate) fn remove(&mut self, key: PrimaryKey) {
        self.modified.remove(&key);
        self.removed.insert(key);
    }

    pub(crate) fn truncate(&mut self) {
        self.truncated = true;
        self.modified.clear();
        self.removed.clear();
    }

    /// Reads this overlay alone (spec §4.5 read-order steps 1-3), returning
    /// `None` when the key falls through to whatever sits below it.
    pub(crate) fn get(&self, key: &PrimaryKey) -> Option<Option<&Value>> {
        if self.removed.contains(key) {
            return Some(None);
        }
        if let Some(v) = self.modified.get(key) {
            return Some(Some(v));
        }
        if self.truncated {
            return Some(None);
        }
        None
    }

    /// Folds `other` on top of `self`, as if every one of `other`'s writes
    /// had been performed directly against `self` (spec §4.5 commit-protocol
    /// step 2c "apply it to its parent", and the nested-commit rule "apply
    /// nested overlay into self").
    pub(crate) fn merge_from(&mut self, other: &Overlay) {
        if other.truncated {
            self.truncate();
        }
        for (k, v) in &other.modified {
            self.put(k.clone(), v.clone());
        }
        for k in &other.removed {
            self.remove(k.clone());
        }
    }
}

/// Spec §3 "Lifecycle" / §4.5 state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Nested,
    Committed,
    Conflicted,
    Aborted,
}

impl TransactionState {
    pub fn is_writable(self) -> bool {
        matches!(self, TransactionState::Open)
    }
}

/// Public handle to a live or resolved transaction. Cloning shares the same
/// underlying node -- every clone observes the same state and writes.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub(crate) id: TxnId,
    pub(crate) store: Arc<ObjectStoreInner>,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub async fn state(&self) -> TransactionState {
        self.store.transaction_state(self.id).await
    }

    /// Read order per spec §4.5: removed → modified → truncated → parent.
    pub async fn get(&self, key: &PrimaryKey) -> Result<Option<Value>> {
        self.store.transaction_get(self.id, key).await
    }

    pub async fn put(&self, key: PrimaryKey, value: Value) -> Result<()> {
        debug!(txn = self.id, "transaction put");
        self.store.transaction_put(self.id, key, value).await
    }

    pub async fn remove(&self, key: &PrimaryKey) -> Result<()> {
        debug!(txn = self.id, "transaction remove");
        self.store.transaction_remove(self.id, key).await
    }

    pub async fn truncate(&self) -> Result<()> {
        debug!(txn = self.id, "transaction truncate");
        self.store.transaction_truncate(self.id).await
    }

    pub async fn keys(&self, index: &str, query: &KeyRange, limit: Option<usize>) -> Result<Vec<PrimaryKey>> {
        self.store.transaction_index_keys(self.id, index, query, limit).await
    }

    pub async fn count(&self, index: &str, query: &KeyRange) -> Result<usize> {
        Ok(self.keys(index, query, None).await?.len())
    }

    /// Commits into the parent state (spec §4.5 commit protocol). `Ok(true)`
    /// means COMMITTED; `Ok(false)` means CONFLICTED.
    pub async fn commit(&self) -> Result<bool> {
        let ok = self.store.commit_transaction(self.id).await?;
        debug!(txn = self.id, committed = ok, "transaction commit");
        Ok(ok)
    }

    pub async fn abort(&self) -> Result<()> {
        debug!(txn = self.id, "transaction abort");
        self.store.abort_transaction(self.id).await
    }

    /// Opens a nested transaction on top of this one (spec §4.5 state
    /// machine, OPEN → NESTED). Rejected unless this transaction is
    /// currently OPEN or already NESTED (another nested child is allowed).
    pub async fn begin_nested(&self) -> Result<Transaction> {
        let nested_id = self.store.begin_nested(self.id).await?;
        Ok(Transaction {
            id: nested_id,
            store: self.store.clone(),
        })
    }
}

pub(crate) fn closed_error() -> Error {
    Error::Closed
}
