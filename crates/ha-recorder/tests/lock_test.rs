//! Database lock for external backups

mod common;

use std::time::Duration;

use common::*;
use ha_core::{Context, Event};
use serde_json::json;

#[tokio::test]
async fn test_lock_blocks_synchronize_until_unlock() {
    let t = async_test_recorder().await;
    assert!(t.recorder.lock_database().await.unwrap());
    assert!(t.recorder.is_locked());
    // A second lock is refused while the first is held
    assert!(!t.recorder.lock_database().await.unwrap());

    assert!(t.recorder.record_event(Event::new("during_backup", json!({}), Context::new())));
    let blocked = tokio::time::timeout(Duration::from_millis(300), t.recorder.async_block_till_done()).await;
    assert!(blocked.is_err());
    // Nothing reached the file while locked
    let on_disk = rusqlite::Connection::open(t.db_path())
        .unwrap()
        .query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))
        .unwrap();
    assert_eq!(on_disk, 0);

    assert!(t.recorder.unlock_database());
    assert!(!t.recorder.is_locked());
    t.sync().await;
    assert_eq!(t.count("events").await, 1);
}

#[tokio::test]
async fn test_unlock_without_lock() {
    let t = async_test_recorder().await;
    assert!(!t.recorder.unlock_database());
}

#[tokio::test]
async fn test_backlog_overflow_releases_lock() {
    let t = async_test_recorder_with(|config| {
        config.tunables.max_backlog = 10;
        config.tunables.lock_check_interval = Duration::from_millis(50);
    })
    .await;
    assert!(t.recorder.lock_database().await.unwrap());

    for i in 0..15 {
        assert!(t.recorder.record_event(Event::new("flood", json!({"i": i}), Context::new())));
    }
    // The writer gives up the lock by itself, so this completes
    tokio::time::timeout(Duration::from_secs(10), t.recorder.async_block_till_done())
        .await
        .unwrap()
        .unwrap();

    assert!(!t.recorder.is_locked());
    assert!(!t.recorder.unlock_database());
    assert_eq!(t.count("events").await, 15);
}
