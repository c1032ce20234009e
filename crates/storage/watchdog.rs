//! Transaction watchdog (spec §5 "Observability"): purely diagnostic. A long-
//! lived transaction blocks its parent's sibling slot and (if nothing else)
//! the stack from flattening past it, so an operator needs to know about it;
//! the watchdog never aborts or otherwise touches the transaction itself.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::object_store::ObjectStoreInner;
use crate::transaction::{TransactionState, TxnId};

/// Spawns a background task that logs a warning if transaction `id` is still
/// open after `timeout`. Fire-and-forget: the task exits either way.
pub(crate) fn watch(store: Arc<ObjectStoreInner>, id: TxnId, timeout: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let state = store.transaction_state(id).await;
        if matches!(state, TransactionState::Open | TransactionState::Nested) {
            warn!(store = %store.name, txn = id, elapsed = ?timeout, "transaction still open past watchdog timeout");
        }
    });
}
