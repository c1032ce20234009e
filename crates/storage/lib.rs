//! An embedded, transactional key-value store with secondary indices: a
//! stack of in-memory transactions layered over a persistent native
//! backend, B+ tree-backed indices, snapshot isolation, and atomic combined
//! commits across stores.

mod btree;
pub mod backend;
pub mod cache;
mod combined_transaction;
pub mod codec;
pub mod config;
mod database;
pub mod error;
pub mod index;
pub mod key;
pub mod keyrange;
mod object_store;
pub mod query;
mod snapshot;
mod transaction;
pub mod value;
mod watchdog;

pub use codec::{Codec, Encoding, JsonCodec};
pub use combined_transaction::CombinedTransaction;
pub use config::{DatabaseOptions, DeleteObjectStoreOptions, IndexOptions, ObjectStoreOptions, UpgradeCondition};
pub use database::{Database, EngineType};
pub use error::{Error, Result};
pub use index::Index;
pub use key::{PrimaryKey, SecondaryKey};
pub use keyrange::KeyRange;
pub use object_store::ObjectStore;
pub use query::{Comparison, Query};
pub use snapshot::Snapshot;
pub use transaction::{Transaction, TxnId};
pub use value::{KeyPath, Value};
