//! The single writer thread
//!
//! All database writes happen here, one task at a time and in queue order.
//! Rows are written into a lazily opened transaction that is committed on
//! `Commit` tasks, before any task that needs a clean session, or after
//! every task when the commit interval is zero.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use ha_core::events::{StateChangedData, STATE_CHANGED};
use ha_core::{EntityId, Event, ATTR_ENTITY_ID};
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::dedup::{DedupCache, EVENT_DATA, STATE_ATTRIBUTES};
use crate::error::{RecorderError, RecorderResult};
use crate::migration::{has_legacy_events_index, migrate};
use crate::pool::{lock_connection, PooledConnection};
use crate::purge::{periodic_db_cleanups, purge_entity_data, purge_old_data, repack, PurgeContext, PurgeOutcome};
use crate::recorder::RecorderShared;
use crate::recovery::{move_away_broken_database, validate_or_move_away, DatabaseHealth};
use crate::runs::RecorderRunsManager;
use crate::schema::{MAX_EVENT_DATA_BYTES, MAX_STATE_ATTRS_BYTES};
use crate::states_manager::StatesManager;
use crate::statistics::{compile_missing_statistics, compile_statistics, import_statistics};
use crate::tasks::{DatabaseLock, LockTask, PurgeEntitiesTask, PurgeTask, Task, TaskReceiver};
use crate::util::dt_to_ts;

const EMPTY_JSON_OBJECT: &str = "{}";

/// Start the writer thread
pub(crate) fn spawn(shared: Arc<RecorderShared>, receiver: TaskReceiver) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("Recorder".to_string())
        .spawn(move || match Writer::connect(shared.clone(), receiver) {
            Ok(writer) => {
                shared.set_ready(true);
                writer.run();
            }
            Err(err) => {
                error!(error = %err, "Failed to set up the database; recorder is not running");
                shared.running.store(false, Ordering::SeqCst);
                shared.set_ready(false);
            }
        })
}

struct Writer {
    shared: Arc<RecorderShared>,
    receiver: TaskReceiver,
    conn: PooledConnection,
    event_data: DedupCache,
    state_attributes: DedupCache,
    states: StatesManager,
    runs: RecorderRunsManager,
    in_transaction: bool,
    commits_since_expire: usize,
    legacy: bool,
    locked: Option<Arc<DatabaseLock>>,
    lock_buffer: Vec<Event>,
}

impl Writer {
    /// Connect with retries, validate and migrate the store, start a run
    fn connect(shared: Arc<RecorderShared>, receiver: TaskReceiver) -> RecorderResult<Self> {
        let config = &shared.config;
        validate_or_move_away(shared.pool.path())?;

        let max_retries = config.db_max_retries.max(1);
        let mut attempt = 0;
        let conn = loop {
            attempt += 1;
            match shared.pool.acquire().and_then(|conn| {
                lock_connection(&conn).execute_batch("SELECT 1")?;
                Ok(conn)
            }) {
                Ok(conn) => break conn,
                Err(err) if attempt < max_retries => {
                    warn!(
                        attempt,
                        retry_in = ?config.db_retry_wait,
                        error = %err,
                        "Error during connection setup; retrying"
                    );
                    thread::sleep(config.db_retry_wait);
                }
                Err(err) => return Err(err),
            }
        };

        let cache_size = config.tunables.cache_size;
        let mut writer = Self {
            shared: shared.clone(),
            receiver,
            conn,
            event_data: DedupCache::new(&EVENT_DATA, cache_size),
            state_attributes: DedupCache::new(&STATE_ATTRIBUTES, cache_size),
            states: StatesManager::new(),
            runs: RecorderRunsManager::new(),
            in_transaction: false,
            commits_since_expire: 0,
            legacy: false,
            locked: None,
            lock_buffer: Vec::new(),
        };

        match writer.setup_database() {
            Ok(()) => {}
            Err(err) if err.is_corruption() => writer.recover(err)?,
            Err(err) => return Err(err),
        }
        shared.queue.send(Task::CompileMissingStatistics);
        info!(path = %shared.pool.path().display(), "Recorder database ready");
        Ok(writer)
    }

    fn setup_database(&mut self) -> RecorderResult<()> {
        let conn = lock_connection(&self.conn);
        let status = migrate(&conn)?;
        debug!(?status, "Schema ready");
        self.legacy = has_legacy_events_index(&conn)?;
        self.runs.start(&conn, Utc::now())?;
        Ok(())
    }

    fn run(mut self) {
        loop {
            let task = match self.locked.clone() {
                Some(lock) => {
                    if lock.is_released() {
                        self.leave_locked_mode();
                        continue;
                    }
                    match self.receiver.recv_timeout(self.shared.config.tunables.lock_check_interval) {
                        Ok(task) => task,
                        Err(RecvTimeoutError::Timeout) => {
                            self.check_lock_overflow(&lock);
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.receiver.recv() {
                    Some(task) => task,
                    None => break,
                },
            };

            trace!(task = task.name(), backlog = self.receiver.backlog(), "Processing task");
            if !self.dispatch(task) {
                break;
            }
        }
        self.stop();
    }

    /// Returns false once the writer should exit
    fn dispatch(&mut self, task: Task) -> bool {
        let Some(lock) = self.locked.clone() else {
            return self.process(task);
        };
        match task {
            Task::Event(event) => {
                self.lock_buffer.push(*event);
                self.check_lock_overflow(&lock);
                true
            }
            // Nothing is committed while an external backup runs
            Task::Commit | Task::KeepAlive => true,
            Task::DatabaseLock(LockTask { locked, .. }) => {
                warn!("Database is already locked; ignoring second lock request");
                drop(locked);
                true
            }
            Task::Stop => {
                lock.release();
                self.leave_locked_mode();
                false
            }
            task => {
                self.wait_for_unlock(&lock);
                self.leave_locked_mode();
                self.process(task)
            }
        }
    }

    fn process(&mut self, task: Task) -> bool {
        if task.commit_before() {
            self.commit_or_retry();
        }

        match task {
            Task::Event(event) => self.process_event(*event),
            Task::Commit => self.commit_or_retry(),
            Task::KeepAlive => {
                self.run_with_retry("keep_alive", |conn| Ok(conn.execute_batch("SELECT 1")?));
            }
            Task::Purge(purge) => self.purge(purge),
            Task::PurgeEntities(purge) => self.purge_entities(purge),
            Task::PeriodicCleanup => {
                self.run_with_retry("periodic_cleanup", periodic_db_cleanups);
            }
            Task::Statistics { start } => {
                self.run_with_retry("statistics", |conn| compile_statistics(conn, start));
            }
            Task::CompileMissingStatistics => {
                let keep_days = self.shared.config.keep_days;
                let periods = self.shared.config.tunables.statistics_periods_per_task;
                let finished = self.run_with_retry("compile_missing_statistics", |conn| {
                    compile_missing_statistics(conn, Utc::now(), keep_days, periods)
                });
                if finished == Some(false) {
                    self.shared.queue.send(Task::CompileMissingStatistics);
                }
            }
            Task::ImportStatistics(import) => {
                self.run_with_retry("import_statistics", |conn| {
                    import_statistics(conn, &import.metadata, &import.statistics, import.table)
                });
            }
            Task::AdjustLruSize(size) => {
                self.event_data.resize(size);
                self.state_attributes.resize(size);
                debug!(size = self.event_data.capacity(), "Adjusted dedup cache size");
            }
            Task::DatabaseLock(lock) => self.enter_locked_mode(lock),
            Task::Synchronize(done) => {
                let _ = done.send(());
            }
            Task::Stop => return false,
        }

        if self.shared.config.commit_interval.is_zero() {
            self.commit_or_retry();
        }
        true
    }

    fn process_event(&mut self, event: Event) {
        if !self.shared.enabled.load(Ordering::SeqCst) {
            trace!(event_type = %event.event_type, "Recording disabled; dropping event");
            return;
        }
        let result = if event.event_type == *STATE_CHANGED {
            self.record_state_change(&event)
        } else {
            self.record_event(&event)
        };
        if let Err(err) = result {
            self.handle_error("event", err);
        }
    }

    fn begin(&mut self, conn: &Connection) -> RecorderResult<()> {
        if !self.in_transaction {
            conn.execute_batch("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn record_event(&mut self, event: &Event) -> RecorderResult<()> {
        let shared_data = if event.data.is_null() {
            EMPTY_JSON_OBJECT.to_string()
        } else {
            serde_json::to_string(&event.data)?
        };
        let shared_data = if shared_data.len() > MAX_EVENT_DATA_BYTES {
            warn!(
                event_type = %event.event_type,
                size = shared_data.len(),
                limit = MAX_EVENT_DATA_BYTES,
                "Event data exceeds the maximum size; it will not be stored"
            );
            EMPTY_JSON_OBJECT.to_string()
        } else {
            shared_data
        };

        let conn_arc = self.conn.clone();
        let conn = lock_connection(&conn_arc);
        self.begin(&conn)?;
        let data_id = self.event_data.lookup_or_insert(&conn, &shared_data)?;
        conn.prepare_cached(
            "INSERT INTO events (event_type, origin_idx, time_fired_ts, context_id, \
             context_user_id, context_parent_id, data_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?
        .execute(params![
            event.event_type.as_str(),
            event.origin.index(),
            dt_to_ts(event.time_fired),
            event.context.id,
            event.context.user_id,
            event.context.parent_id,
            data_id,
        ])?;
        Ok(())
    }

    fn record_state_change(&mut self, event: &Event) -> RecorderResult<()> {
        let data = match serde_json::from_value::<StateChangedData>(event.data.clone()) {
            Ok(data) => data,
            Err(err) => {
                let Some(entity_id) = event
                    .data
                    .get(ATTR_ENTITY_ID)
                    .and_then(Value::as_str)
                    .and_then(|id| id.parse::<EntityId>().ok())
                else {
                    return Err(err.into());
                };
                warn!(entity_id = %entity_id, error = %err, "State change could not be decoded; recording it without a state");
                StateChangedData {
                    entity_id,
                    old_state: None,
                    new_state: None,
                }
            }
        };
        let entity_id = data.entity_id.to_string();

        let shared_attrs = match &data.new_state {
            Some(state) => {
                let attrs = serde_json::to_string(&state.attributes)?;
                if attrs.len() > MAX_STATE_ATTRS_BYTES {
                    warn!(
                        entity_id = %entity_id,
                        size = attrs.len(),
                        limit = MAX_STATE_ATTRS_BYTES,
                        "State attributes exceed the maximum size; they will not be stored"
                    );
                    EMPTY_JSON_OBJECT.to_string()
                } else {
                    attrs
                }
            }
            None => EMPTY_JSON_OBJECT.to_string(),
        };

        let conn_arc = self.conn.clone();
        let conn = lock_connection(&conn_arc);
        self.begin(&conn)?;

        let old_state_id = match self.states.latest(&entity_id) {
            Some(id) => Some(id),
            None if data.old_state.is_some() => StatesManager::latest_in_database(&conn, &entity_id)?,
            None => None,
        };
        let attributes_id = self.state_attributes.lookup_or_insert(&conn, &shared_attrs)?;

        let (state, last_changed, last_updated, last_reported, context) = match &data.new_state {
            Some(new) => (
                Some(new.state.as_str()),
                new.last_changed,
                new.last_updated,
                new.last_reported,
                &new.context,
            ),
            None => (None, event.time_fired, event.time_fired, None, &event.context),
        };

        let state_id = conn
            .prepare_cached(
                "INSERT INTO states (entity_id, state, attributes_id, event_id, last_changed_ts, \
                 last_updated_ts, last_reported_ts, old_state_id, origin_idx, context_id, \
                 context_user_id, context_parent_id) \
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?
            .insert(params![
                entity_id,
                state,
                attributes_id,
                dt_to_ts(last_changed),
                dt_to_ts(last_updated),
                last_reported.map(dt_to_ts),
                old_state_id,
                event.origin.index(),
                context.id,
                context.user_id,
                context.parent_id,
            ])?;

        if data.new_state.is_some() {
            self.states.add_pending(&entity_id, state_id);
        } else {
            self.states.forget(&entity_id);
        }
        Ok(())
    }

    fn commit(&mut self, conn: &Connection) -> RecorderResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        self.event_data.post_commit();
        self.state_attributes.post_commit();
        self.states.post_commit();

        self.commits_since_expire += 1;
        if self.commits_since_expire >= self.shared.config.tunables.expire_after_commits {
            conn.flush_prepared_statement_cache();
            conn.execute_batch("PRAGMA shrink_memory")?;
            self.commits_since_expire = 0;
            trace!("Expired session cache");
        }
        Ok(())
    }

    fn commit_or_retry(&mut self) {
        if !self.in_transaction {
            return;
        }
        let conn_arc = self.conn.clone();
        let config = self.shared.clone();
        let max_retries = config.config.db_max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let conn = lock_connection(&conn_arc);
                self.commit(&conn)
            };
            match result {
                Ok(()) => return,
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    warn!(attempt, error = %err, "Database is busy; retrying commit");
                    thread::sleep(config.config.db_retry_wait);
                }
                Err(err) => {
                    self.handle_error("commit", err);
                    return;
                }
            }
        }
    }

    /// Run a job against the writer connection, retrying busy errors
    fn run_with_retry<T>(
        &mut self,
        task: &'static str,
        mut job: impl FnMut(&Connection) -> RecorderResult<T>,
    ) -> Option<T> {
        let conn_arc = self.conn.clone();
        let shared = self.shared.clone();
        let max_retries = shared.config.db_max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let conn = lock_connection(&conn_arc);
                job(&conn)
            };
            match result {
                Ok(value) => return Some(value),
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    warn!(task, attempt, error = %err, "Database is busy; retrying");
                    thread::sleep(shared.config.db_retry_wait);
                }
                Err(err) => {
                    self.handle_error(task, err);
                    return None;
                }
            }
        }
    }

    fn handle_error(&mut self, task: &'static str, err: RecorderError) {
        if err.is_corruption() {
            if let Err(err) = self.recover(err) {
                error!(error = %err, "Failed to reinitialize the database");
            }
            return;
        }
        if let RecorderError::Json(err) = &err {
            warn!(task, error = %err, "Could not decode task data; dropping it");
            return;
        }
        error!(task, error = %err, "Error executing task; dropping it");
        self.rollback();
    }

    fn rollback(&mut self) {
        if self.in_transaction {
            let conn = lock_connection(&self.conn);
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "Rollback failed");
            }
            self.in_transaction = false;
        }
        self.event_data.reset_pending();
        self.state_attributes.reset_pending();
        self.states.reset_pending();
    }

    /// Move the broken file aside and continue on a fresh store
    fn recover(&mut self, cause: RecorderError) -> RecorderResult<()> {
        error!(error = %cause, "Unrecoverable database error; the database will be replaced");
        self.shared.set_health(DatabaseHealth::Quarantining);
        self.in_transaction = false;
        self.event_data.clear();
        self.state_attributes.clear();
        self.states.clear();
        self.runs.clear();
        self.shared.pool.dispose();
        move_away_broken_database(self.shared.pool.path())?;

        self.shared.set_health(DatabaseHealth::Reinitializing);
        self.conn = self.shared.pool.acquire()?;
        self.setup_database()?;
        self.shared.set_health(DatabaseHealth::Healthy);
        info!("Recorder continues on a new database");
        Ok(())
    }

    fn evict_purged(&mut self, outcome: &PurgeOutcome) {
        self.states.evict_purged_state_ids(&outcome.state_ids);
        self.states.evict_purged_entity_ids(&outcome.entity_ids);
        self.state_attributes.evict_purged(&outcome.attributes_ids);
        self.event_data.evict_purged(&outcome.data_ids);
    }

    fn purge(&mut self, task: PurgeTask) {
        let shared = self.shared.clone();
        let ctx = PurgeContext {
            purge_before: task.purge_before,
            tunables: &shared.config.tunables,
            active_run_id: self.runs.active_run_id(),
            legacy: self.legacy,
        };
        let filter = task.apply_filter.then_some(&shared.filter);
        let Some(outcome) = self.run_with_retry("purge", |conn| purge_old_data(conn, &ctx, filter)) else {
            return;
        };
        self.evict_purged(&outcome);
        if outcome.legacy_index_dropped {
            self.legacy = false;
        }

        if !outcome.finished {
            debug!("Purge not finished; re-queueing");
            shared.queue.send(Task::Purge(task));
            return;
        }
        if task.repack {
            self.run_with_retry("repack", repack);
        }
        self.run_with_retry("periodic_cleanup", periodic_db_cleanups);
        info!(purge_before = %task.purge_before, "Purge finished");
    }

    fn purge_entities(&mut self, task: PurgeEntitiesTask) {
        let shared = self.shared.clone();
        let ctx = PurgeContext {
            purge_before: task.purge_before,
            tunables: &shared.config.tunables,
            active_run_id: self.runs.active_run_id(),
            legacy: self.legacy,
        };
        let Some(outcome) =
            self.run_with_retry("purge_entities", |conn| purge_entity_data(conn, &task.filter, &ctx))
        else {
            return;
        };
        self.evict_purged(&outcome);
        if !outcome.finished {
            shared.queue.send(Task::PurgeEntities(task));
        }
    }

    fn enter_locked_mode(&mut self, task: LockTask) {
        self.commit_or_retry();
        info!("Database locked for external access");
        self.locked = Some(task.lock);
        let _ = task.locked.send(());
    }

    fn leave_locked_mode(&mut self) {
        if self.locked.take().is_none() {
            return;
        }
        let buffered = std::mem::take(&mut self.lock_buffer);
        info!(buffered = buffered.len(), "Database unlocked; writing buffered events");
        for event in buffered {
            self.process_event(event);
        }
        self.commit_or_retry();
    }

    fn check_lock_overflow(&self, lock: &DatabaseLock) {
        let pending = self.lock_buffer.len() + self.receiver.backlog();
        if pending >= self.shared.config.tunables.max_backlog && !lock.is_released() {
            warn!(
                pending,
                max_backlog = self.shared.config.tunables.max_backlog,
                "Database queue backlog reached while locked; unlocking the database to prevent data loss"
            );
            lock.release_on_overflow();
        }
    }

    fn wait_for_unlock(&self, lock: &DatabaseLock) {
        let interval = self.shared.config.tunables.lock_check_interval;
        while !lock.wait_released(interval) {
            self.check_lock_overflow(lock);
        }
    }

    fn stop(&mut self) {
        self.commit_or_retry();
        {
            let conn = lock_connection(&self.conn);
            if let Err(err) = self.runs.end(&conn, Utc::now()) {
                error!(error = %err, "Failed to end the recorder run");
            }
        }
        self.shared.pool.shutdown();
        self.shared.running.store(false, Ordering::SeqCst);
        info!("Recorder stopped");
    }
}
