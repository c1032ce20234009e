//! Black-box coverage of spec.md §8's seed scenarios S1-S6, driven entirely
//! through the public `Database`/`ObjectStore` surface.

use stackdb::{Database, DatabaseOptions, EngineType, IndexOptions, KeyPath, KeyRange, ObjectStoreOptions, SecondaryKey, Value};

fn pk(s: &str) -> bytes::Bytes {
    bytes::Bytes::copy_from_slice(s.as_bytes())
}

async fn open_store(db: &Database, name: &str) -> stackdb::ObjectStore {
    db.create_object_store(name, ObjectStoreOptions { persistent: true, ..Default::default() }, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn s1_read_isolation() {
    let db = Database::open("/tmp/unused-s1", 1, EngineType::InMemory, DatabaseOptions::default()).unwrap();
    db.connect().await.unwrap();
    let store = open_store(&db, "s").await;

    let t1 = store.transaction().await.unwrap();
    let t2 = store.transaction().await.unwrap();

    t1.put(pk("a"), Value::Number(1.0)).await.unwrap();
    assert!(t1.commit().await.unwrap());

    assert_eq!(t2.get(&pk("a")).await.unwrap(), None);

    let t3 = store.transaction().await.unwrap();
    assert_eq!(t3.get(&pk("a")).await.unwrap(), Some(Value::Number(1.0)));
}

#[tokio::test]
async fn s2_first_committer_wins() {
    let db = Database::open("/tmp/unused-s2", 1, EngineType::InMemory, DatabaseOptions::default()).unwrap();
    db.connect().await.unwrap();
    let store = open_store(&db, "s").await;

    let t1 = store.transaction().await.unwrap();
    let t2 = store.transaction().await.unwrap();

    t1.put(pk("a"), Value::Number(1.0)).await.unwrap();
    t2.put(pk("a"), Value::Number(2.0)).await.unwrap();

    assert!(t1.commit().await.unwrap());
    assert!(!t2.commit().await.unwrap());

    assert_eq!(store.get(&pk("a")).await.unwrap(), Some(Value::Number(1.0)));
}

#[tokio::test]
async fn s3_unique_index_rejects_duplicate_and_leaves_store_unchanged() {
    let db = Database::open("/tmp/unused-s3", 1, EngineType::InMemory, DatabaseOptions::default()).unwrap();
    db.connect().await.unwrap();
    let store = open_store(&db, "s").await;
    store
        .create_index("byVal", KeyPath::Single("val".into()), IndexOptions { unique: true, ..Default::default() })
        .await
        .unwrap();

    let mut obj1 = std::collections::BTreeMap::new();
    obj1.insert("val".to_string(), Value::Number(7.0));
    store.put(pk("k1"), Value::Object(obj1)).await.unwrap();

    let mut obj2 = std::collections::BTreeMap::new();
    obj2.insert("val".to_string(), Value::Number(7.0));
    let err = store.put(pk("k2"), Value::Object(obj2)).await.unwrap_err();
    assert!(matches!(err, stackdb::Error::ConstraintViolation { .. }));

    assert_eq!(store.count().await.unwrap(), 1);
    assert_eq!(store.get(&pk("k2")).await.unwrap(), None);
}

#[tokio::test]
async fn s4_multi_entry_index_maps_each_array_element() {
    let db = Database::open("/tmp/unused-s4", 1, EngineType::InMemory, DatabaseOptions::default()).unwrap();
    db.connect().await.unwrap();
    let store = open_store(&db, "s").await;
    store
        .create_index("tags", KeyPath::Single("tags".into()), IndexOptions { multi_entry: true, ..Default::default() })
        .await
        .unwrap();

    let mut obj = std::collections::BTreeMap::new();
    obj.insert(
        "tags".to_string(),
        Value::Array(vec![Value::Str("a".into()), Value::Str("b".into())]),
    );
    store.put(pk("r1"), Value::Object(obj)).await.unwrap();

    let a_hits = store
        .keys("tags", &KeyRange::only(SecondaryKey::Str("a".into())), None)
        .await
        .unwrap();
    assert_eq!(a_hits, vec![pk("r1")]);

    let b_hits = store
        .keys("tags", &KeyRange::only(SecondaryKey::Str("b".into())), None)
        .await
        .unwrap();
    assert_eq!(b_hits, vec![pk("r1")]);
}

#[tokio::test]
async fn s5_combined_commit_is_atomic_across_two_stores() {
    let db = Database::open("/tmp/unused-s5", 1, EngineType::InMemory, DatabaseOptions::default()).unwrap();
    db.connect().await.unwrap();
    let s1 = open_store(&db, "s1").await;
    let s2 = open_store(&db, "s2").await;

    let t1 = s1.transaction().await.unwrap();
    let t2 = s2.transaction().await.unwrap();
    t1.put(pk("x"), Value::Number(1.0)).await.unwrap();
    t2.put(pk("y"), Value::Number(2.0)).await.unwrap();

    assert!(db.commit_combined(&[&t1, &t2]).await.unwrap());

    assert_eq!(s1.get(&pk("x")).await.unwrap(), Some(Value::Number(1.0)));
    assert_eq!(s2.get(&pk("y")).await.unwrap(), Some(Value::Number(2.0)));
}

#[cfg(feature = "redb")]
#[tokio::test]
async fn s5_combined_commit_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(dir.path(), 1, EngineType::Redb, DatabaseOptions::default()).unwrap();
        db.connect().await.unwrap();
        let s1 = open_store(&db, "s1").await;
        let s2 = open_store(&db, "s2").await;
        let t1 = s1.transaction().await.unwrap();
        let t2 = s2.transaction().await.unwrap();
        t1.put(pk("x"), Value::Number(1.0)).await.unwrap();
        t2.put(pk("y"), Value::Number(2.0)).await.unwrap();
        assert!(db.commit_combined(&[&t1, &t2]).await.unwrap());
        db.close().await;
    }

    let db = Database::open(dir.path(), 1, EngineType::Redb, DatabaseOptions::default()).unwrap();
    db.connect().await.unwrap();
    let s1 = open_store(&db, "s1").await;
    let s2 = open_store(&db, "s2").await;
    assert_eq!(s1.get(&pk("x")).await.unwrap(), Some(Value::Number(1.0)));
    assert_eq!(s2.get(&pk("y")).await.unwrap(), Some(Value::Number(2.0)));
}

#[tokio::test]
async fn s6_snapshot_survives_a_truncate() {
    let db = Database::open("/tmp/unused-s6", 1, EngineType::InMemory, DatabaseOptions::default()).unwrap();
    db.connect().await.unwrap();
    let store = open_store(&db, "s").await;

    store.put(pk("a"), Value::Number(1.0)).await.unwrap();
    store.put(pk("b"), Value::Number(2.0)).await.unwrap();
    store.put(pk("c"), Value::Number(3.0)).await.unwrap();

    let snap = store.snapshot().await;
    store.truncate().await.unwrap();

    assert_eq!(snap.get(&pk("a")).await.unwrap(), Some(Value::Number(1.0)));
    assert_eq!(snap.get(&pk("b")).await.unwrap(), Some(Value::Number(2.0)));
    assert_eq!(snap.get(&pk("c")).await.unwrap(), Some(Value::Number(3.0)));

    assert_eq!(store.get(&pk("a")).await.unwrap(), None);
}
