//! Shared harness for recorder integration tests
//!
//! Every recorder runs against its own temporary SQLite file, commits after
//! every task and has the nightly/five-minute timers switched off so tests
//! drive purges and statistics explicitly.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use ha_core::{Attributes, Context, EntityId, State};
use ha_recorder::{Recorder, RecorderConfig};
use serde_json::Value;
use tempfile::TempDir;

pub struct TestRecorder {
    pub dir: TempDir,
    pub recorder: Recorder,
}

impl TestRecorder {
    pub fn db_path(&self) -> PathBuf {
        db_path(&self.dir)
    }

    pub async fn count(&self, table: &str) -> i64 {
        count_rows(&self.recorder, table).await
    }

    /// Single-column integer query through the recorder executor
    pub async fn query_ids(&self, sql: &str) -> Vec<Option<i64>> {
        let sql = sql.to_string();
        self.recorder
            .async_add_executor_job(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], |row| row.get::<_, Option<i64>>(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .unwrap()
    }

    pub async fn sync(&self) {
        self.recorder.async_block_till_done().await.unwrap();
    }
}

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("home-assistant_v2.db")
}

pub fn test_config(dir: &TempDir) -> RecorderConfig {
    let mut config = RecorderConfig::with_sqlite_file(&db_path(dir)).unwrap();
    config.commit_interval = Duration::ZERO;
    config.db_retry_wait = Duration::from_millis(10);
    config.tunables.periodic_tasks = false;
    config
}

pub async fn start_in(dir: &TempDir, configure: impl FnOnce(&mut RecorderConfig)) -> Recorder {
    let mut config = test_config(dir);
    configure(&mut config);
    let recorder = Recorder::start(config).await.unwrap();
    assert!(recorder.async_db_ready().await);
    recorder
}

pub async fn async_test_recorder() -> TestRecorder {
    async_test_recorder_with(|_| {}).await
}

pub async fn async_test_recorder_with(configure: impl FnOnce(&mut RecorderConfig)) -> TestRecorder {
    let dir = tempfile::tempdir().unwrap();
    let recorder = start_in(&dir, configure).await;
    TestRecorder { dir, recorder }
}

pub async fn count_rows(recorder: &Recorder, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    recorder
        .async_add_executor_job(move |conn| Ok(conn.query_row(&sql, [], |row| row.get::<_, i64>(0))?))
        .await
        .unwrap()
}

/// Fixed point in the past that tests offset from
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
}

pub fn entity(entity_id: &str) -> EntityId {
    entity_id.parse().unwrap()
}

pub fn state(entity_id: &str, value: &str, attributes: Value, when: DateTime<Utc>) -> State {
    let attributes = match attributes {
        Value::Object(map) => map,
        _ => Attributes::new(),
    };
    State::new(entity(entity_id), value, attributes, Context::new()).at(when)
}

/// Record a chain of states for one entity, each linked to the previous one
pub fn record_states(recorder: &Recorder, states: &[State]) {
    let mut previous: Option<State> = None;
    for state in states {
        assert!(recorder.record_state_change(state.entity_id.clone(), previous.clone(), Some(state.clone())));
        previous = Some(state.clone());
    }
}
