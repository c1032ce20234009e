//! Transaction-Index (spec §3, §4.5): per-transaction overlay that unifies
//! this transaction's own index writes with reads that fall through to the
//! parent state's index, the same three-level shape `Transaction::get`
//! uses for ordinary keys.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Index, InMemoryIndex};
use crate::error::{Error, Result};
use crate::key::PrimaryKey;
use crate::keyrange::KeyRange;
use crate::value::{KeyPath, Value};

/// Primary keys this transaction has put or removed at least once (shadowing
/// `parent`'s entry for them) plus the truncate flag, bundled so a single
/// lock covers both (spec §4.5 `_truncated`/write bookkeeping).
#[derive(Debug, Default)]
struct Shadow {
    touched: HashSet<PrimaryKey>,
    truncated: bool,
}

#[derive(Debug)]
pub struct TransactionIndex {
    parent: Arc<dyn Index>,
    local: InMemoryIndex,
    shadow: Mutex<Shadow>,
}

impl TransactionIndex {
    pub fn new(parent: Arc<dyn Index>, key_path: KeyPath, unique: bool, multi_entry: bool) -> Self {
        let name = parent.name().to_string();
        Self {
            parent,
            local: InMemoryIndex::new(name, key_path, unique, multi_entry),
            shadow: Mutex::new(Shadow::default()),
        }
    }
}

#[async_trait]
impl Index for TransactionIndex {
    fn name(&self) -> &str {
        self.local.name()
    }

    async fn put(&self, primary_key: &PrimaryKey, new_value: Option<&Value>, old_value: Option<&Value>) -> Result<()> {
        if self.local.is_unique() {
            #[allow(clippy::unwrap_used)]
            let (truncated, touched) = {
                let shadow = self.shadow.lock().unwrap();
                (shadow.truncated, shadow.touched.clone())
            };
            if !truncated {
                let new_keys = new_value
                    .map(|v| self.local.key_path().secondary_keys(v, self.local.is_multi_entry()))
                    .unwrap_or_default();
                for key in &new_keys {
                    // Effective state == parent merged with this overlay (spec
                    // §4.5 Write): a primary key this transaction has already
                    // touched no longer carries the parent's value for it.
                    let hits = self.parent.keys(&KeyRange::only(key.clone()), None).await?;
                    if hits.iter().any(|pk| pk != primary_key && !touched.contains(pk)) {
                        return Err(Error::ConstraintViolation {
                            index: self.name().to_string(),
                        });
                    }
                }
            }
        }
        self.local.put(primary_key, new_value, old_value).await?;
        #[allow(clippy::unwrap_used)]
        self.shadow.lock().unwrap().touched.insert(primary_key.clone());
        Ok(())
    }

    async fn remove(&self, primary_key: &PrimaryKey, old_value: Option<&Value>) -> Result<()> {
        self.local.remove(primary_key, old_value).await?;
        #[allow(clippy::unwrap_used)]
        self.shadow.lock().unwrap().touched.insert(primary_key.clone());
        Ok(())
    }

    async fn keys(&self, query: &KeyRange, limit: Option<usize>) -> Result<Vec<PrimaryKey>> {
        let mut out = Vec::new();
        #[allow(clippy::unwrap_used)]
        let (truncated, parent_keys) = {
            let shadow = self.shadow.lock().unwrap();
            (shadow.truncated, shadow.touched.clone())
        };
        if !truncated {
            for pk in self.parent.keys(query, None).await? {
                if !parent_keys.contains(&pk) {
                    out.push(pk);
                }
            }
        }
        out.extend(self.local.keys(query, None).await?);
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn min_keys(&self) -> Result<Vec<PrimaryKey>> {
        let local_min = self.local.min_keys().await?;
        #[allow(clippy::unwrap_used)]
        let (truncated, touched) = {
            let shadow = self.shadow.lock().unwrap();
            (shadow.truncated, shadow.touched.clone())
        };
        if truncated || !local_min.is_empty() {
            return Ok(local_min);
        }
        Ok(self
            .parent
            .min_keys()
            .await?
            .into_iter()
            .filter(|pk| !touched.contains(pk))
            .collect())
    }

    async fn max_keys(&self) -> Result<Vec<PrimaryKey>> {
        let local_max = self.local.max_keys().await?;
        #[allow(clippy::unwrap_used)]
        let (truncated, touched) = {
            let shadow = self.shadow.lock().unwrap();
            (shadow.truncated, shadow.touched.clone())
        };
        if truncated || !local_max.is_empty() {
            return Ok(local_max);
        }
        Ok(self
            .parent
            .max_keys()
            .await?
            .into_iter()
            .filter(|pk| !touched.contains(pk))
            .collect())
    }

    async fn truncate(&self) -> Result<()> {
        self.local.truncate().await?;
        #[allow(clippy::unwrap_used)]
        {
            let mut shadow = self.shadow.lock().unwrap();
            shadow.truncated = true;
            shadow.touched.clear();
        }
        Ok(())
    }

    async fn key_stream(&self, ascending: bool, query: &KeyRange, callback: &mut (dyn FnMut(&PrimaryKey) -> bool + Send)) {
        let mut stop = false;
        #[allow(clippy::unwrap_used)]
        let (truncated, touched) = {
            let shadow = self.shadow.lock().unwrap();
            (shadow.truncated, shadow.touched.clone())
        };
        if !truncated {
            let stop_ref = &mut stop;
            self.parent
                .key_stream(ascending, query, &mut |pk| {
                    if touched.contains(pk) {
                        return true;
                    }
                    if !callback(pk) {
                        *stop_ref = true;
                        return false;
                    }
                    true
                })
                .await;
        }
        if stop {
            return;
        }
        self.local.key_stream(ascending, query, callback).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SecondaryKey;
    use bytes::Bytes;

    fn pk(s: &str) -> PrimaryKey {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn obj(k: &str, v: Value) -> Value {
        Value::Object([(k.to_string(), v)].into_iter().collect())
    }

    #[tokio::test]
    async fn reads_fall_through_to_parent_until_overwritten() {
        let parent = InMemoryIndex::new("byVal", KeyPath::Single("val".into()), false, false);
        parent
            .put(&pk("k1"), Some(&obj("val", Value::Number(1.0))), None)
            .await
            .unwrap();
        let parent: Arc<dyn Index> = Arc::new(parent);

        let txn_idx = TransactionIndex::new(parent, KeyPath::Single("val".into()), false, false);
        let keys = txn_idx.keys(&KeyRange::only(SecondaryKey::Number(1.0)), None).await.unwrap();
        assert_eq!(keys, vec![pk("k1")]);
    }

    #[tokio::test]
    async fn local_write_shadows_the_parent_entry() {
        let parent = InMemoryIndex::new("byVal", KeyPath::Single("val".into()), false, false);
        parent
            .put(&pk("k1"), Some(&obj("val", Value::Number(1.0))), None)
            .await
            .unwrap();
        let parent: Arc<dyn Index> = Arc::new(parent);

        let txn_idx = TransactionIndex::new(parent, KeyPath::Single("val".into()), false, false);
        txn_idx
            .put(&pk("k1"), Some(&obj("val", Value::Number(2.0))), Some(&obj("val", Value::Number(1.0))))
            .await
            .unwrap();

        assert!(txn_idx
            .keys(&KeyRange::only(SecondaryKey::Number(1.0)), None)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            txn_idx.keys(&KeyRange::only(SecondaryKey::Number(2.0)), None).await.unwrap(),
            vec![pk("k1")]
        );
    }

    #[tokio::test]
    async fn truncate_masks_every_parent_entry() {
        let parent = InMemoryIndex::new("byVal", KeyPath::Single("val".into()), false, false);
        parent
            .put(&pk("k1"), Some(&obj("val", Value::Number(1.0))), None)
            .await
            .unwrap();
        let parent: Arc<dyn Index> = Arc::new(parent);

        let txn_idx = TransactionIndex::new(parent, KeyPath::Single("val".into()), false, false);
        txn_idx.truncate().await.unwrap();
        assert!(txn_idx.keys(&KeyRange::all(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unique_violation_is_detected_across_a_committed_parent_layer() {
        // Mirrors how `object_store.rs` adopts a committed `TransactionIndex`
        // as the store's new base index: a second transaction wraps that
        // committed layer with a fresh, empty `local` overlay.
        let base = InMemoryIndex::new("byVal", KeyPath::Single("val".into()), true, false);
        let base: Arc<dyn Index> = Arc::new(base);

        let committed: Arc<dyn Index> = Arc::new(TransactionIndex::new(base, KeyPath::Single("val".into()), true, false));
        committed
            .put(&pk("k1"), Some(&obj("val", Value::Number(7.0))), None)
            .await
            .unwrap();

        let txn_idx = TransactionIndex::new(committed, KeyPath::Single("val".into()), true, false);
        let err = txn_idx
            .put(&pk("k2"), Some(&obj("val", Value::Number(7.0))), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { .. }));
    }
}
