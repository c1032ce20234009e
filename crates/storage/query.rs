//! Composable queries over an object store's indices (spec §4.4): a tree of
//! per-index comparisons combined with AND (intersection) / OR (union), plus
//! MIN/MAX shortcuts that go straight to `Index::min_keys`/`max_keys`
//! instead of a full scan.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::index::Index;
use crate::key::{PrimaryKey, SecondaryKey};
use crate::keyrange::KeyRange;
use crate::object_store::ObjectStore;

/// A single comparison against one index (spec §4.4 operator list).
#[derive(Clone, Debug)]
pub enum Comparison {
    Eq(SecondaryKey),
    Gt(SecondaryKey),
    Gte(SecondaryKey),
    Lt(SecondaryKey),
    Lte(SecondaryKey),
    Between { lower: SecondaryKey, upper: SecondaryKey, lower_open: bool, upper_open: bool },
    Within(Vec<SecondaryKey>),
    Min,
    Max,
}

impl Comparison {
    fn to_ranges(&self) -> Option<Vec<KeyRange>> {
        match self {
            Comparison::Eq(k) => Some(vec![KeyRange::only(k.clone())]),
            Comparison::Gt(k) => Some(vec![KeyRange::lower_bound(k.clone(), true)]),
            Comparison::Gte(k) => Some(vec![KeyRange::lower_bound(k.clone(), false)]),
            Comparison::Lt(k) => Some(vec![KeyRange::upper_bound(k.clone(), true)]),
            Comparison::Lte(k) => Some(vec![KeyRange::upper_bound(k.clone(), false)]),
            Comparison::Between { lower, upper, lower_open, upper_open } => {
                Some(vec![KeyRange::bound(lower.clone(), upper.clone(), *lower_open, *upper_open)])
            }
            Comparison::Within(keys) => Some(keys.iter().cloned().map(KeyRange::only).collect()),
            Comparison::Min | Comparison::Max => None,
        }
    }
}

/// A node in the query tree: either a leaf comparison against a named index,
/// or a boolean combination of sub-queries.
#[derive(Clone, Debug)]
pub enum Query {
    Match { index: String, comparison: Comparison },
    And(Vec<Query>),
    Or(Vec<Query>),
}

impl Query {
    pub fn eq(index: impl Into<String>, key: SecondaryKey) -> Self {
        Query::Match { index: index.into(), comparison: Comparison::Eq(key) }
    }

    pub fn between(index: impl Into<String>, lower: SecondaryKey, upper: SecondaryKey, lower_open: bool, upper_open: bool) -> Self {
        Query::Match {
            index: index.into(),
            comparison: Comparison::Between { lower, upper, lower_open, upper_open },
        }
    }

    pub fn within(index: impl Into<String>, keys: Vec<SecondaryKey>) -> Self {
        Query::Match { index: index.into(), comparison: Comparison::Within(keys) }
    }

    pub fn and(parts: Vec<Query>) -> Self {
        Query::And(parts)
    }

    pub fn or(parts: Vec<Query>) -> Self {
        Query::Or(parts)
    }

    /// Evaluates the query against `store`'s current committed state,
    /// returning at most `limit` primary keys. AND intersects; OR unions
    /// with the limit applied as results accumulate (spec §4.4).
    pub async fn run(&self, store: &ObjectStore, limit: Option<usize>) -> Result<Vec<PrimaryKey>> {
        let mut out = self.eval(store).await?;
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out.into_iter().collect())
    }

    async fn eval(&self, store: &ObjectStore) -> Result<BTreeSet<PrimaryKey>> {
        match self {
            Query::Match { index, comparison } => eval_leaf(store, index, comparison).await,
            Query::And(parts) => {
                let mut iter = parts.iter();
                let Some(first) = iter.next() else {
                    return Ok(BTreeSet::new());
                };
                let mut acc = Box::pin(first.eval(store)).await?;
                for p in iter {
                    let next = Box::pin(p.eval(store)).await?;
                    acc = acc.intersection(&next).cloned().collect();
                    if acc.is_empty() {
                        break;
                    }
                }
                Ok(acc)
            }
            Query::Or(parts) => {
                let mut acc = BTreeSet::new();
                for p in parts {
                    acc.extend(Box::pin(p.eval(store)).await?);
                }
                Ok(acc)
            }
        }
    }
}

async fn eval_leaf(store: &ObjectStore, index_name: &str, comparison: &Comparison) -> Result<BTreeSet<PrimaryKey>> {
    let index = store.index_handle(index_name).await?;
    let mut out = BTreeSet::new();
    match comparison {
        Comparison::Min => out.extend(index.min_keys().await?),
        Comparison::Max => out.extend(index.max_keys().await?),
        other => {
            let ranges = other.to_ranges().expect("non-Min/Max comparisons always produce at least one range");
            for range in ranges {
                out.extend(index.keys(&range, None).await?);
            }
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::codec::JsonCodec;
    use crate::config::{IndexOptions, ObjectStoreOptions};
    use crate::object_store::ObjectStoreInner;
    use crate::value::{KeyPath, Value};
    use bytes::Bytes;
    use std::sync::Arc;

    fn pk(s: &str) -> PrimaryKey {
        Bytes::copy_from_slice(s.as_bytes())
    }

    async fn make_store() -> ObjectStore {
        let backend = Arc::new(InMemoryBackend::new());
        let inner = Arc::new(ObjectStoreInner::new(
            "widgets".into(),
            &ObjectStoreOptions { persistent: true, ..Default::default() },
            Arc::new(JsonCodec),
            backend.clone(),
            backend,
        ));
        let store = ObjectStore { inner };
        store
            .create_index("color", KeyPath::Single("color".into()), IndexOptions::default())
            .await
            .unwrap();
        store
            .create_index("price", KeyPath::Single("price".into()), IndexOptions::default())
            .await
            .unwrap();
        store
    }

    fn widget(color: &str, price: f64) -> Value {
        Value::Object(
            [
                ("color".to_string(), Value::Str(color.to_string())),
                ("price".to_string(), Value::Number(price)),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[tokio::test]
    async fn and_intersects_two_index_matches() {
        let store = make_store().await;
        store.put(pk("r"), widget("red", 10.0)).await.unwrap();
        store.put(pk("rb"), widget("red", 20.0)).await.unwrap();
        store.put(pk("b"), widget("blue", 10.0)).await.unwrap();

        let q = Query::and(vec![
            Query::eq("color", SecondaryKey::Str("red".into())),
            Query::eq("price", SecondaryKey::Number(10.0)),
        ]);
        let result = q.run(&store, None).await.unwrap();
        assert_eq!(result, vec![pk("r")]);
    }

    #[tokio::test]
    async fn within_unions_the_listed_keys() {
        let store = make_store().await;
        store.put(pk("r"), widget("red", 10.0)).await.unwrap();
        store.put(pk("b"), widget("blue", 20.0)).await.unwrap();
        store.put(pk("g"), widget("green", 30.0)).await.unwrap();

        let q = Query::within("color", vec![SecondaryKey::Str("red".into()), SecondaryKey::Str("green".into())]);
        let mut result = q.run(&store, None).await.unwrap();
        result.sort();
        assert_eq!(result, vec![pk("g"), pk("r")]);
    }

    #[tokio::test]
    async fn or_unions_two_index_matches() {
        let store = make_store().await;
        store.put(pk("r"), widget("red", 10.0)).await.unwrap();
        store.put(pk("b"), widget("blue", 20.0)).await.unwrap();
        store.put(pk("g"), widget("green", 30.0)).await.unwrap();

        let q = Query::or(vec![
            Query::eq("color", SecondaryKey::Str("red".into())),
            Query::eq("color", SecondaryKey::Str("blue".into())),
        ]);
        let mut result = q.run(&store, None).await.unwrap();
        result.sort();
        assert_eq!(result, vec![pk("b"), pk("r")]);
    }
}
