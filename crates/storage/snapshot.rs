//! Snapshot (spec §4.7): a read-only view of an object store frozen at
//! creation time, implemented as reverse deltas rather than a full copy.
//!
//! A `Snapshot` starts with an empty overlay sitting at whatever position
//! was current when it was taken. Every time that position's data is about
//! to be overwritten by a flatten, [`crate::object_store::ObjectStoreInner`]
//! records the *old* value for each touched key into the snapshot's overlay
//! (only the first time -- later flattens must not clobber an already-frozen
//! value) and re-binds the snapshot to sit on top of wherever the flatten
//! landed. A read that isn't in the snapshot's own overlay falls through to
//! its current position, exactly like an ordinary transaction read.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::key::PrimaryKey;
use crate::object_store::ObjectStoreInner;
use crate::transaction::{Overlay, TxnId};
use crate::value::Value;

pub type SnapshotId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Position {
    Backend,
    Txn(TxnId),
}

#[derive(Debug)]
struct Entry {
    position: Position,
    overlay: Overlay,
}

#[derive(Debug, Default)]
pub(crate) struct SnapshotManager {
    entries: HashMap<SnapshotId, Entry>,
    next_id: SnapshotId,
}

impl SnapshotManager {
    pub(crate) fn register(&mut self, position: Position) -> SnapshotId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                position,
                overlay: Overlay::default(),
            },
        );
        id
    }

    pub(crate) fn drop_snapshot(&mut self, id: SnapshotId) {
        self.entries.remove(&id);
    }

    pub(crate) fn position(&self, id: SnapshotId) -> Option<Position> {
        self.entries.get(&id).map(|e| e.position)
    }

    /// Every snapshot currently sitting at `position` (spec §4.7: applied
    /// whenever that position's state is about to flatten away).
    pub(crate) fn at(&self, position: &Position) -> Vec<SnapshotId> {
        self.entries.iter().filter(|(_, e)| &e.position == position).map(|(id, _)| *id).collect()
    }

    pub(crate) fn rebind(&mut self, id: SnapshotId, to: Position) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.position = to;
        }
    }

    /// Freezes `old_value` for `key` under snapshot `id`, but only if this
    /// snapshot hasn't already recorded something for `key` -- the first
    /// flatten past a snapshot's position is the one whose "before" value
    /// matters; later ones are already masked by this recorded entry.
    pub(crate) fn record_if_absent(&mut self, id: SnapshotId, key: PrimaryKey, old_value: Option<Value>) {
        let Some(e) = self.entries.get_mut(&id) else {
            return;
        };
        if e.overlay.modified.contains_key(&key) || e.overlay.removed.contains(&key) {
            return;
        }
        match old_value {
            Some(v) => {
                e.overlay.modified.insert(key, v);
            }
            None => {
                e.overlay.removed.insert(key);
            }
        }
    }

    pub(crate) fn get_recorded(&self, id: SnapshotId, key: &PrimaryKey) -> Option<Option<Value>> {
        let e = self.entries.get(&id)?;
        if e.overlay.removed.contains(key) {
            return Some(None);
        }
        e.overlay.modified.get(key).cloned().map(Some)
    }
}

/// Public read-only handle to a snapshot (spec §2 "snapshot/read view").
#[derive(Clone)]
pub struct Snapshot {
    pub(crate) id: SnapshotId,
    pub(crate) store: Arc<ObjectStoreInner>,
}

impl Snapshot {
    pub async fn get(&self, key: &PrimaryKey) -> Result<Option<Value>> {
        self.store.snapshot_get(self.id, key).await
    }

    pub async fn close(self) {
        self.store.close_snapshot(self.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pk(s: &str) -> PrimaryKey {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn record_if_absent_keeps_the_first_value() {
        let mut mgr = SnapshotManager::default();
        let id = mgr.register(Position::Backend);
        mgr.record_if_absent(id, pk("a"), Some(Value::Number(1.0)));
        mgr.record_if_absent(id, pk("a"), Some(Value::Number(2.0)));
        assert_eq!(mgr.get_recorded(id, &pk("a")), Some(Some(Value::Number(1.0))));
    }

    #[test]
    fn rebind_moves_the_snapshot_to_a_new_position() {
        let mut mgr = SnapshotManager::default();
        let id = mgr.register(Position::Backend);
        mgr.rebind(id, Position::Txn(7));
        assert_eq!(mgr.position(id), Some(Position::Txn(7)));
    }
}
