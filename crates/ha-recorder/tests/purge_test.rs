//! Retention through the writer queue

mod common;

use chrono::{DateTime, Duration, Utc};
use common::*;
use ha_core::{Context, Event};
use ha_recorder::migration::has_legacy_events_index;
use ha_recorder::util::dt_to_ts;
use ha_recorder::{PurgeTask, Task};
use rusqlite::params;
use serde_json::json;

fn purge_task(purge_before: DateTime<Utc>) -> Task {
    Task::Purge(PurgeTask {
        purge_before,
        repack: false,
        apply_filter: false,
    })
}

#[tokio::test]
async fn test_purge_keeps_rows_at_cutoff() {
    let t = async_test_recorder().await;
    let (t1, t2, t3) = (
        base_time(),
        base_time() + Duration::hours(1),
        base_time() + Duration::hours(2),
    );
    let states = vec![
        state("sensor.power", "1", json!({"unit": "W"}), t1),
        state("sensor.power", "2", json!({"unit": "W"}), t2),
        state("sensor.power", "3", json!({"unit": "W"}), t3),
    ];
    record_states(&t.recorder, &states);
    t.sync().await;
    let ids = t.query_ids("SELECT state_id FROM states ORDER BY last_updated_ts").await;

    assert!(t.recorder.queue_task(purge_task(t2)));
    t.sync().await;

    let remaining = t.query_ids("SELECT state_id FROM states ORDER BY last_updated_ts").await;
    assert_eq!(remaining, vec![ids[1], ids[2]]);
    let links = t
        .query_ids("SELECT old_state_id FROM states ORDER BY last_updated_ts")
        .await;
    // t2 lost its link to the purged t1; t3 still points at t2
    assert_eq!(links, vec![None, ids[1]]);
    assert_eq!(t.count("state_attributes").await, 1);
}

#[tokio::test]
async fn test_purge_converges_with_small_batches() {
    let t = async_test_recorder_with(|config| {
        config.tunables.purge_batch_size = 2;
        config.tunables.purge_batches_per_task = 1;
    })
    .await;
    let states: Vec<_> = (0..9)
        .map(|i| state("sensor.flow", &i.to_string(), json!({"i": i}), base_time() + Duration::seconds(i)))
        .collect();
    record_states(&t.recorder, &states);
    for i in 0..5 {
        let event = Event::new("tick", json!({"i": i}), Context::new()).fired_at(base_time());
        assert!(t.recorder.record_event(event));
    }
    t.sync().await;

    assert!(t.recorder.queue_task(purge_task(base_time() + Duration::days(1))));
    let mut previous = i64::MAX;
    for _ in 0..30 {
        t.sync().await;
        let remaining = t.count("states").await + t.count("events").await;
        // Every pass removes something or nothing is left
        assert!(remaining < previous || remaining == 0);
        previous = remaining;
        if remaining == 0 {
            break;
        }
    }
    // A purge pass still in flight may be deleting payload rows
    for _ in 0..5 {
        t.sync().await;
    }
    assert_eq!(t.count("states").await, 0);
    assert_eq!(t.count("events").await, 0);
    assert_eq!(t.count("state_attributes").await, 0);
    assert_eq!(t.count("event_data").await, 0);
}

#[tokio::test]
async fn test_purge_empty_database_finishes() {
    let t = async_test_recorder().await;
    assert!(t.recorder.purge(10, true, false));
    t.sync().await;
    assert_eq!(t.count("states").await, 0);
    assert_eq!(t.count("recorder_runs").await, 1);
}

#[tokio::test]
async fn test_purge_keeps_active_run() {
    let t = async_test_recorder().await;
    assert!(t.recorder.queue_task(purge_task(Utc::now() + Duration::days(1))));
    t.sync().await;

    let open = t
        .query_ids(r#"SELECT COUNT(*) FROM recorder_runs WHERE "end" IS NULL"#)
        .await;
    assert_eq!(open, vec![Some(1)]);
    assert_eq!(t.count("statistics_runs").await, 1);
}

#[tokio::test]
async fn test_purge_with_filter_removes_excluded_entities() {
    let dir = tempfile::tempdir().unwrap();
    {
        let recorder = start_in(&dir, |_| {}).await;
        record_states(&recorder, &[state("light.old", "on", json!({}), Utc::now())]);
        record_states(&recorder, &[state("sensor.kept", "1", json!({}), Utc::now())]);
        recorder.async_block_till_done().await.unwrap();
        recorder.shutdown().await.unwrap();
    }

    let recorder = start_in(&dir, |config| config.exclude.domains = vec!["light".to_string()]).await;
    assert!(recorder.purge(10, false, true));
    recorder.async_block_till_done().await.unwrap();
    recorder.async_block_till_done().await.unwrap();

    assert_eq!(count_rows(&recorder, "states").await, 1);
    recorder.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_purge_entities_service() {
    let t = async_test_recorder().await;
    record_states(&t.recorder, &[state("sensor.a", "1", json!({}), base_time())]);
    record_states(&t.recorder, &[state("sensor.b", "1", json!({}), base_time())]);
    record_states(&t.recorder, &[state("switch.c", "on", json!({}), base_time())]);
    t.sync().await;

    t.recorder
        .call_service("purge_entities", &json!({"entity_globs": "sensor.*"}))
        .unwrap();
    t.sync().await;
    assert_eq!(t.count("states").await, 1);
}

#[tokio::test]
async fn test_legacy_purge_drops_event_index() {
    let dir = tempfile::tempdir().unwrap();
    {
        let conn = rusqlite::Connection::open(db_path(&dir)).unwrap();
        ha_recorder::migration::migrate(&conn).unwrap();
        conn.execute_batch("CREATE INDEX ix_states_event_id ON states(event_id);")
            .unwrap();
        let when = dt_to_ts(base_time());
        for i in 0..3 {
            conn.execute(
                "INSERT INTO events (event_type, time_fired_ts) VALUES ('state_changed', ?1)",
                [when + f64::from(i)],
            )
            .unwrap();
            let event_id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO states (entity_id, state, event_id, last_updated_ts) VALUES ('sensor.legacy', ?1, ?2, ?3)",
                params![i.to_string(), event_id, when + f64::from(i)],
            )
            .unwrap();
        }
    }

    let recorder = start_in(&dir, |_| {}).await;
    assert!(recorder
        .async_add_executor_job(|conn| has_legacy_events_index(conn))
        .await
        .unwrap());

    assert!(recorder.queue_task(purge_task(base_time() + Duration::days(1))));
    recorder.async_block_till_done().await.unwrap();

    assert_eq!(count_rows(&recorder, "states").await, 0);
    assert_eq!(count_rows(&recorder, "events").await, 0);
    assert!(!recorder
        .async_add_executor_job(|conn| has_legacy_events_index(conn))
        .await
        .unwrap());
    recorder.shutdown().await.unwrap();
}
