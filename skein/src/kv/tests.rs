use super::*;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn set_get_del() {
    let kv = KvStore::new();
    assert_eq!(kv.get("k"), None);
    kv.set("k".into(), "v".into());
    assert_eq!(kv.get("k"), Some("v".into()));
    kv.set("k".into(), "v2".into());
    assert_eq!(kv.get("k"), Some("v2".into()));
    assert!(kv.del("k"));
    assert!(!kv.del("k"));
    assert_eq!(kv.get("k"), None);
}

#[test]
fn snapshot_is_a_copy() {
    let kv = KvStore::new();
    kv.set("a".into(), "1".into());
    kv.set("b".into(), "2".into());
    let snapshot = kv.snapshot();
    kv.set("c".into(), "3".into());
    assert_eq!(snapshot.len(), 2);
    assert_eq!(kv.len(), 3);
}

#[tokio::test]
async fn wait_returns_existing_value_immediately() {
    let kv = KvStore::new();
    kv.set("k".into(), "v".into());
    assert_eq!(kv.wait("k").await, "v");
}

#[tokio::test]
async fn wait_blocks_until_set() {
    let kv = Arc::new(KvStore::new());
    let waiter = tokio::spawn({
        let kv = Arc::clone(&kv);
        async move { kv.wait("k").await }
    });
    // The waiter must actually block, not spin on a missing key.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    kv.set("k".into(), "v".into());
    assert_eq!(waiter.await.unwrap(), "v");
}

#[tokio::test]
async fn single_set_wakes_all_waiters() {
    let kv = Arc::new(KvStore::new());
    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let kv = Arc::clone(&kv);
            tokio::spawn(async move { kv.wait("k").await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    kv.set("k".into(), "v".into());
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), "v");
    }
}

#[tokio::test]
async fn delete_does_not_wake_waiters() {
    let kv = Arc::new(KvStore::new());
    kv.set("k".into(), "v1".into());
    kv.del("k");
    let waiter = tokio::spawn({
        let kv = Arc::clone(&kv);
        async move { kv.wait("k").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    kv.del("k");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    kv.set("k".into(), "v2".into());
    assert_eq!(waiter.await.unwrap(), "v2");
}

#[tokio::test]
async fn cancelled_waiter_is_deregistered() {
    let kv = Arc::new(KvStore::new());
    let waiter = tokio::spawn({
        let kv = Arc::clone(&kv);
        async move { kv.wait("k").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(kv.waiter_count("k"), 1);
    waiter.abort();
    let _ = waiter.await;
    assert_eq!(kv.waiter_count("k"), 0);

    // The set is still visible to later getters.
    kv.set("k".into(), "v".into());
    assert_eq!(kv.get("k"), Some("v".into()));
}

#[tokio::test]
async fn concurrent_writers_leave_a_single_winner() {
    let kv = Arc::new(KvStore::new());
    let writers: Vec<_> = (0..16)
        .map(|i| {
            let kv = Arc::clone(&kv);
            tokio::spawn(async move { kv.set("k".into(), i.to_string()) })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }
    let value = kv.get("k").unwrap();
    let value: usize = value.parse().unwrap();
    assert!(value < 16);
}
