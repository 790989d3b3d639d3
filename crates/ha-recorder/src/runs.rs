//! Recorder run bookkeeping
//!
//! Each writer lifetime is one `recorder_runs` row. The active run has no
//! `end`; runs left open by a crash are closed as `closed_incorrect` when the
//! next run starts.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::error::RecorderResult;
use crate::util::{dt_to_ts, ts_to_dt};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecorderRun {
    pub run_id: i64,
    pub start: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RecorderRunsManager {
    current: Option<RecorderRun>,
}

impl RecorderRunsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<RecorderRun> {
        self.current
    }

    pub fn active_run_id(&self) -> Option<i64> {
        self.current.map(|run| run.run_id)
    }

    /// Close runs left open and start a new one.
    ///
    /// The start time never goes backwards, even if the clock did.
    pub fn start(&mut self, conn: &Connection, now: DateTime<Utc>) -> RecorderResult<RecorderRun> {
        let last_start: Option<f64> =
            conn.query_row("SELECT MAX(start) FROM recorder_runs", [], |row| row.get(0))?;
        let start = match last_start.map(ts_to_dt) {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        };

        let start_ts = dt_to_ts(start);
        let closed = conn.execute(
            r#"UPDATE recorder_runs SET "end" = ?1, closed_incorrect = 1 WHERE "end" IS NULL"#,
            [start_ts],
        )?;
        if closed > 0 {
            warn!(runs = closed, "Ended unfinished session (was the recorder shut down cleanly?)");
        }

        conn.execute(
            "INSERT INTO recorder_runs (start, created) VALUES (?1, ?2)",
            params![start_ts, dt_to_ts(Utc::now())],
        )?;
        let run = RecorderRun {
            run_id: conn.last_insert_rowid(),
            start,
        };
        debug!(run_id = run.run_id, start = %run.start, "Started recorder run");
        self.current = Some(run);
        Ok(run)
    }

    /// Close the active run
    pub fn end(&mut self, conn: &Connection, now: DateTime<Utc>) -> RecorderResult<()> {
        if let Some(run) = self.current.take() {
            let end = now.max(run.start);
            conn.execute(
                r#"UPDATE recorder_runs SET "end" = ?1 WHERE run_id = ?2"#,
                params![dt_to_ts(end), run.run_id],
            )?;
            debug!(run_id = run.run_id, "Ended recorder run");
        }
        Ok(())
    }

    /// Forget the active run without touching the database
    pub fn clear(&mut self) {
        self.current = None;
    }
}
