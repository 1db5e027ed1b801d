// LocalStore tests: connect, init, put, TTL cleanup, duplicate keys, queries

use indocker_sync::models::{ContainerSnapshot, ContainerStatus, DockerStateSnapshot};
use indocker_sync::store::{DEFAULT_TTL, LocalStore, StoreError};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;

fn snapshot(ids: &[&str]) -> DockerStateSnapshot {
    let containers: BTreeMap<String, ContainerSnapshot> = ids
        .iter()
        .map(|id| {
            let snap: ContainerSnapshot = serde_json::from_value(serde_json::json!({
                "inspect": { "Id": id, "Name": format!("/{}", id), "State": { "Status": "running" } },
                "stats": {
                    "memory_stats": { "usage": 1024, "limit": 4096, "max_usage": 2048 }
                }
            }))
            .unwrap();
            (id.to_string(), snap)
        })
        .collect();
    DockerStateSnapshot { containers }
}

async fn open_store(dir: &TempDir, ttl: Duration) -> LocalStore {
    let path = dir.path().join("state.db");
    let store = LocalStore::connect(path.to_str().unwrap(), ttl, 2)
        .await
        .unwrap();
    store.init().await.unwrap();
    store
}

#[tokio::test]
async fn store_connect_and_init() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, DEFAULT_TTL).await;
    // Second init is no-op (IF NOT EXISTS)
    store.init().await.unwrap();
    assert_eq!(store.count().await.unwrap(), (0, 0));
    assert!(store.latest().await.unwrap().is_none());
}

#[tokio::test]
async fn put_writes_snapshot_and_label_together() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, DEFAULT_TTL).await;

    let ts = store.put(&snapshot(&["a", "b"])).await.unwrap();
    assert_eq!(store.count().await.unwrap(), (1, 1));

    let latest = store.latest().await.unwrap().unwrap();
    assert_eq!(latest.ts, ts);
    assert_eq!(latest.ids, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(latest.state.containers["a"].name(), Some("a"));
    assert_eq!(latest.state.containers["a"].status(), ContainerStatus::Running);

    let labels = store.labels(ts, ts + 1).await.unwrap();
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].ts, ts);
    assert_eq!(labels[0].label.len(), 8);
}

#[tokio::test]
async fn put_keys_by_current_time_in_millis() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, DEFAULT_TTL).await;

    let before = chrono::Utc::now().timestamp_millis();
    let ts = store.put(&snapshot(&["a"])).await.unwrap();
    let after = chrono::Utc::now().timestamp_millis();
    assert!(before <= ts && ts <= after, "{} not in {}..={}", ts, before, after);

    // a fresh record survives the cleanup that runs with the write
    store.cleanup().await.unwrap();
    assert_eq!(store.count().await.unwrap(), (1, 1));
}

#[tokio::test]
async fn ttl_cleanup_keeps_only_fresh_record() {
    let dir = TempDir::new().unwrap();
    let ttl = DEFAULT_TTL;
    let ttl_ms = ttl.as_millis() as i64;
    let store = open_store(&dir, ttl).await;

    store.put_at(1000, &snapshot(&["old"])).await.unwrap();
    let second = 1000 + ttl_ms + 1;
    store.put_at(second, &snapshot(&["new"])).await.unwrap();
    store.cleanup_at(second).await.unwrap();

    let all = store.range(0, i64::MAX).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].ts, second);
    assert_eq!(store.count().await.unwrap(), (1, 1));
    assert!(store.memory_history("old").await.unwrap().is_empty());
}

#[tokio::test]
async fn record_exactly_at_cutoff_survives() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, Duration::from_secs(1)).await;

    store.put_at(1000, &snapshot(&["a"])).await.unwrap();
    store.put_at(2000, &snapshot(&["a"])).await.unwrap();
    assert_eq!(store.count().await.unwrap(), (2, 2));

    let removed = store.cleanup_at(2001).await.unwrap();
    assert_eq!(removed.snapshots, 1);
    assert_eq!(removed.labels, 1);
    assert_eq!(removed.usage, 1);
    assert_eq!(store.count().await.unwrap(), (1, 1));
}

#[tokio::test]
async fn duplicate_key_is_a_constraint_error_and_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, DEFAULT_TTL).await;

    store.put_at(5000, &snapshot(&["a"])).await.unwrap();
    let err = store.put_at(5000, &snapshot(&["b"])).await.unwrap_err();
    assert!(matches!(err, StoreError::Constraint { ts: 5000 }), "{:?}", err);

    let latest = store.latest().await.unwrap().unwrap();
    assert_eq!(latest.ids, vec!["a".to_string()]);
    assert_eq!(store.count().await.unwrap(), (1, 1));
}

#[tokio::test]
async fn recent_and_range_are_ascending() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, DEFAULT_TTL).await;
    for ts in [1000, 2000, 3000, 4000] {
        store.put_at(ts, &snapshot(&["a"])).await.unwrap();
    }

    let recent: Vec<i64> = store.recent(2).await.unwrap().iter().map(|s| s.ts).collect();
    assert_eq!(recent, vec![3000, 4000]);

    let range: Vec<i64> = store
        .range(2000, 4000)
        .await
        .unwrap()
        .iter()
        .map(|s| s.ts)
        .collect();
    assert_eq!(range, vec![2000, 3000]);

    let labels: Vec<i64> = store
        .labels(0, i64::MAX)
        .await
        .unwrap()
        .iter()
        .map(|l| l.ts)
        .collect();
    assert_eq!(labels, vec![1000, 2000, 3000, 4000]);
}

#[tokio::test]
async fn memory_history_tracks_usage_per_container() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, DEFAULT_TTL).await;
    store.put_at(1000, &snapshot(&["a", "b"])).await.unwrap();
    store.put_at(2000, &snapshot(&["a"])).await.unwrap();

    let a = store.memory_history("a").await.unwrap();
    assert_eq!(a.iter().map(|(ts, _)| *ts).collect::<Vec<_>>(), vec![1000, 2000]);
    assert_eq!(a[0].1.memory_usage_bytes, 1024);
    assert_eq!(a[0].1.memory_limit_bytes, 4096);
    assert_eq!(a[0].1.status, ContainerStatus::Running);

    assert_eq!(store.memory_history("b").await.unwrap().len(), 1);
}

#[tokio::test]
async fn read_only_connection_sees_writes_and_cannot_write() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, DEFAULT_TTL).await;
    store.put_at(1000, &snapshot(&["a"])).await.unwrap();

    let path = dir.path().join("state.db");
    let reader = LocalStore::connect_read_only(path.to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(reader.latest().await.unwrap().unwrap().ts, 1000);
    assert!(reader.put_at(2000, &snapshot(&["a"])).await.is_err());

    store.put_at(2000, &snapshot(&["b"])).await.unwrap();
    assert_eq!(reader.latest().await.unwrap().unwrap().ts, 2000);
}

#[tokio::test]
async fn vacuum_runs() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, DEFAULT_TTL).await;
    store.put_at(1000, &snapshot(&["a"])).await.unwrap();
    store.vacuum().await.unwrap();
    store.close().await;
}
