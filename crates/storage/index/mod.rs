//! Secondary indices (spec §4.2/§4.3): a common [`Index`] contract shared by
//! the in-memory B+ tree implementation, the persistent-backend variant, and
//! the per-transaction overlay that unifies the two (spec §9 "Polymorphism").

pub mod persistent;
pub mod transaction_index;

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::btree::BPlusTree;
use crate::error::{Error, Result};
use crate::key::{PrimaryKey, SecondaryKey};
use crate::keyrange::KeyRange;
use crate::value::{KeyPath, Value};

pub use persistent::PersistentIndex;
pub use transaction_index::TransactionIndex;

/// Shared contract implemented by every index flavor (spec §4.2 step 1-4,
/// §9 "Polymorphism"). `async` uniformly, even though the in-memory variant
/// never actually suspends: only the persistent variant's calls into the
/// backend are real suspension points (spec §5), and callers in
/// `transaction.rs`/`object_store.rs` shouldn't need to know which index
/// flavor they're driving.
///
/// Mutating methods take `&self`: the object store and every open
/// transaction hold `Arc<dyn Index>` clones of the same base index, so
/// interior mutability (a lock inside each concrete impl) replaces outer
/// `&mut` borrows.
#[async_trait]
pub trait Index: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Reconciles the secondary keys `oldValue` and `newValue` extract,
    /// removing stale entries and inserting current ones.
    async fn put(&self, primary_key: &PrimaryKey, new_value: Option<&Value>, old_value: Option<&Value>) -> Result<()>;

    async fn remove(&self, primary_key: &PrimaryKey, old_value: Option<&Value>) -> Result<()>;

    async fn keys(&self, query: &KeyRange, limit: Option<usize>) -> Result<Vec<PrimaryKey>>;

    async fn min_keys(&self) -> Result<Vec<PrimaryKey>>;

    async fn max_keys(&self) -> Result<Vec<PrimaryKey>>;

    async fn count(&self, query: &KeyRange) -> Result<usize> {
        Ok(self.keys(query, None).await?.len())
    }

    async fn truncate(&self) -> Result<()>;

    async fn key_stream(&self, ascending: bool, query: &KeyRange, callback: &mut (dyn FnMut(&PrimaryKey) -> bool + Send));
}

/// In-memory secondary index: a B+ tree of order 7 mapping secondary key to
/// the sorted set of primary keys sharing it (spec §4.2).
#[derive(Debug)]
pub struct InMemoryIndex {
    name: String,
    key_path: KeyPath,
    unique: bool,
    multi_entry: bool,
    tree: Mutex<BPlusTree<SecondaryKey, BTreeSet<PrimaryKey>>>,
}

impl InMemoryIndex {
    pub fn new(name: impl Into<String>, key_path: KeyPath, unique: bool, multi_entry: bool) -> Self {
        Self {
            name: name.into(),
            key_path,
            unique,
            multi_entry,
            tree: Mutex::new(BPlusTree::default()),
        }
    }

    pub fn key_path(&self) -> &KeyPath {
        &self.key_path
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_multi_entry(&self) -> bool {
        self.multi_entry
    }

    fn extract(&self, value: &Value) -> Vec<SecondaryKey> {
        self.key_path.secondary_keys(value, self.multi_entry)
    }

    fn insert_one(tree: &mut BPlusTree<SecondaryKey, BTreeSet<PrimaryKey>>, key: &SecondaryKey, primary_key: PrimaryKey) {
        if let Some(set) = tree.get_mut(key) {
            set.insert(primary_key);
        } else {
            let mut set = BTreeSet::new();
            set.insert(primary_key);
            tree.insert(key.clone(), set);
        }
    }

    fn remove_one(tree: &mut BPlusTree<SecondaryKey, BTreeSet<PrimaryKey>>, key: &SecondaryKey, primary_key: &PrimaryKey) {
        let mut now_empty = false;
        if let Some(set) = tree.get_mut(key) {
            set.remove(primary_key);
            now_empty = set.is_empty();
        }
        if now_empty {
            tree.remove(key);
        }
    }

    fn check_unique(
        &self,
        tree: &BPlusTree<SecondaryKey, BTreeSet<PrimaryKey>>,
        primary_key: &PrimaryKey,
        new_keys: &[SecondaryKey],
    ) -> Result<()> {
        if !self.unique {
            return Ok(());
        }
        for k in new_keys {
            if let Some(existing) = tree.get(k) {
                if !existing.is_empty() && !existing.contains(primary_key) {
                    return Err(Error::ConstraintViolation {
                        index: self.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Index for InMemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, primary_key: &PrimaryKey, new_value: Option<&Value>, old_value: Option<&Value>) -> Result<()> {
        let old_keys = old_value.map(|v| self.extract(v)).unwrap_or_default();
        let new_keys = new_value.map(|v| self.extract(v)).unwrap_or_default();
        if old_keys == new_keys {
            return Ok(());
        }
        #[allow(clippy::unwrap_used)]
        let mut tree = self.tree.lock().unwrap();
        self.check_unique(&tree, primary_key, &new_keys)?;
        for k in &old_keys {
            Self::remove_one(&mut tree, k, primary_key);
        }
        for k in &new_keys {
            Self::insert_one(&mut tree, k, primary_key.clone());
        }
        Ok(())
    }

    async fn remove(&self, primary_key: &PrimaryKey, old_value: Option<&Value>) -> Result<()> {
        let old_keys = old_value.map(|v| self.extract(v)).unwrap_or_default();
        #[allow(clippy::unwrap_used)]
        let mut tree = self.tree.lock().unwrap();
        for k in &old_keys {
            Self::remove_one(&mut tree, k, primary_key);
        }
        Ok(())
    }

    async fn keys(&self, query: &KeyRange, limit: Option<usize>) -> Result<Vec<PrimaryKey>> {
        #[allow(clippy::unwrap_used)]
        let tree = self.tree.lock().unwrap();
        let mut out = Vec::new();
        let mut cur = match &query.lower {
            Some(l) => tree.go_to_lower_bound(l, query.lower_open),
            None => tree.go_top(),
        };
        while let (Some(k), Some(set)) = (cur.current_key.clone(), cur.current_record.clone()) {
            if !query.includes(&k) {
                break;
            }
            for pk in &set {
                out.push(pk.clone());
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
            cur = tree.next(&cur);
        }
        Ok(out)
    }

    async fn min_keys(&self) -> Result<Vec<PrimaryKey>> {
        #[allow(clippy::unwrap_used)]
        let tree = self.tree.lock().unwrap();
        Ok(match tree.go_top().current_record {
            Some(set) => set.into_iter().collect(),
            None => Vec::new(),
        })
    }

    async fn max_keys(&self) -> Result<Vec<PrimaryKey>> {
        #[allow(clippy::unwrap_used)]
        let tree = self.tree.lock().unwrap();
        Ok(match tree.go_bottom().current_record {
            Some(set) => set.into_iter().collect(),
            None => Vec::new(),
        })
    }

    async fn truncate(&self) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        let mut tree = self.tree.lock().unwrap();
        *tree = BPlusTree::default();
        Ok(())
    }

    async fn key_stream(&self, ascending: bool, query: &KeyRange, callback: &mut (dyn FnMut(&PrimaryKey) -> bool + Send)) {
        #[allow(clippy::unwrap_used)]
        let tree = self.tree.lock().unwrap();
        let mut cur = if ascending {
            match &query.lower {
                Some(l) => tree.go_to_lower_bound(l, query.lower_open),
                None => tree.go_top(),
            }
        } else {
            match &query.upper {
                Some(u) => tree.go_to_upper_bound(u, query.upper_open),
                None => tree.go_bottom(),
            }
        };
        while let (Some(k), Some(set)) = (cur.current_key.clone(), cur.current_record.clone()) {
            if !query.includes(&k) {
                break;
            }
            let ordered: Vec<&PrimaryKey> = if ascending {
                set.iter().collect()
            } else {
                set.iter().rev().collect()
            };
            for pk in ordered {
                if !callback(pk) {
                    return;
                }
            }
            cur = if ascending { tree.next(&cur) } else { tree.prev(&cur) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pk(s: &str) -> PrimaryKey {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn obj(k: &str, v: Value) -> Value {
        Value::Object([(k.to_string(), v)].into_iter().collect())
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicate_secondary_key() {
        let idx = InMemoryIndex::new("byVal", KeyPath::Single("val".into()), true, false);
        idx.put(&pk("k1"), Some(&obj("val", Value::Number(7.0))), None).await.unwrap();
        let err = idx
            .put(&pk("k2"), Some(&obj("val", Value::Number(7.0))), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn unique_index_allows_reinserting_same_pair() {
        let idx = InMemoryIndex::new("byVal", KeyPath::Single("val".into()), true, false);
        idx.put(&pk("k1"), Some(&obj("val", Value::Number(7.0))), None).await.unwrap();
        idx.put(&pk("k1"), Some(&obj("val", Value::Number(7.0))), Some(&obj("val", Value::Number(7.0))))
            .await
            .unwrap();
        assert_eq!(
            idx.keys(&KeyRange::only(SecondaryKey::Number(7.0)), None).await.unwrap(),
            vec![pk("k1")]
        );
    }

    #[tokio::test]
    async fn multi_entry_index_finds_record_by_each_tag() {
        let idx = InMemoryIndex::new("tags", KeyPath::Single("tags".into()), false, true);
        let tags = Value::Array(vec![Value::Str("a".into()), Value::Str("b".into())]);
        idx.put(&pk("r1"), Some(&obj("tags", tags)), None).await.unwrap();
        assert_eq!(
            idx.keys(&KeyRange::only(SecondaryKey::Str("a".into())), None).await.unwrap(),
            vec![pk("r1")]
        );
        assert_eq!(
            idx.keys(&KeyRange::only(SecondaryKey::Str("b".into())), None).await.unwrap(),
            vec![pk("r1")]
        );
    }

    #[tokio::test]
    async fn non_unique_index_unions_matching_primary_keys() {
        let idx = InMemoryIndex::new("byVal", KeyPath::Single("val".into()), false, false);
        idx.put(&pk("k1"), Some(&obj("val", Value::Number(1.0))), None).await.unwrap();
        idx.put(&pk("k2"), Some(&obj("val", Value::Number(1.0))), None).await.unwrap();
        let mut ks = idx.keys(&KeyRange::only(SecondaryKey::Number(1.0)), None).await.unwrap();
        ks.sort();
        assert_eq!(ks, vec![pk("k1"), pk("k2")]);
    }

    #[tokio::test]
    async fn removing_last_primary_key_drops_the_tree_entry() {
        let idx = InMemoryIndex::new("byVal", KeyPath::Single("val".into()), false, false);
        idx.put(&pk("k1"), Some(&obj("val", Value::Number(1.0))), None).await.unwrap();
        idx.remove(&pk("k1"), Some(&obj("val", Value::Number(1.0)))).await.unwrap();
        assert!(idx.keys(&KeyRange::all(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncate_clears_all_entries() {
        let idx = InMemoryIndex::new("byVal", KeyPath::Single("val".into()), false, false);
        idx.put(&pk("k1"), Some(&obj("val", Value::Number(1.0))), None).await.unwrap();
        idx.truncate().await.unwrap();
        assert!(idx.keys(&KeyRange::all(), None).await.unwrap().is_empty());
    }
}
