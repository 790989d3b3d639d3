//! The recorder handle
//!
//! [`Recorder::start`] spawns the writer thread and the scheduler. Producers
//! call [`Recorder::record_event`] and friends, which only filter and
//! enqueue; they never touch the database.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use chrono::{Duration, Utc};
use ha_core::events::StateChangedData;
use ha_core::{Context, EntityId, Event, State};
use rusqlite::Connection;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::RecorderConfig;
use crate::error::{ConfigError, RecorderError, RecorderResult};
use crate::filters::{EntityFilter, EventFilter};
use crate::pool::{lock_connection, RecorderPool};
use crate::recovery::DatabaseHealth;
use crate::scheduler::Scheduler;
use crate::statistics::{validate_import, StatisticData, StatisticMetaData, StatisticsTable};
use crate::tasks::{
    task_queue, DatabaseLock, ImportStatisticsTask, LockTask, PurgeEntitiesTask, PurgeTask, Task, TaskQueue,
};
use crate::writer;

/// State shared by the handle, the writer thread and the scheduler
pub(crate) struct RecorderShared {
    pub(crate) config: RecorderConfig,
    pub(crate) filter: EventFilter,
    pub(crate) queue: TaskQueue,
    pub(crate) pool: RecorderPool,
    /// Events are written (services `enable` / `disable`)
    pub(crate) enabled: AtomicBool,
    /// Producers may enqueue; cleared when the backlog overflows
    pub(crate) accepting: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) db_lock: Mutex<Option<Arc<DatabaseLock>>>,
    health: Mutex<DatabaseHealth>,
    ready: watch::Sender<Option<bool>>,
}

impl RecorderShared {
    pub(crate) fn set_health(&self, health: DatabaseHealth) {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = health;
    }

    pub(crate) fn health(&self) -> DatabaseHealth {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.send_replace(Some(ready));
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.db_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|lock| !lock.is_released())
    }
}

/// Handle to a running recorder
pub struct Recorder {
    shared: Arc<RecorderShared>,
    writer: Mutex<Option<JoinHandle<()>>>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Recorder {
    /// Start the writer thread and the scheduler.
    ///
    /// Must be called from within a tokio runtime. Database setup runs on
    /// the writer thread; await [`Recorder::async_db_ready`] for its result.
    #[instrument(skip_all, fields(db_url = %config.db_url.url))]
    pub async fn start(config: RecorderConfig) -> RecorderResult<Self> {
        let path: PathBuf = match config.db_path() {
            Some(path) => path.to_path_buf(),
            None => {
                return Err(ConfigError::UnsupportedDialect {
                    dialect: config.dialect().name().to_string(),
                }
                .into())
            }
        };
        let filter = EventFilter::new(&config.include, &config.exclude)?;
        let (queue, receiver) = task_queue();
        let (ready, _) = watch::channel(None);

        let shared = Arc::new(RecorderShared {
            config,
            filter,
            queue,
            pool: RecorderPool::new(path.clone()),
            enabled: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(true),
            db_lock: Mutex::new(None),
            health: Mutex::new(DatabaseHealth::Healthy),
            ready,
        });

        let writer = writer::spawn(shared.clone(), receiver).map_err(|source| RecorderError::Io { path, source })?;
        let scheduler = Scheduler::start(shared.clone());
        info!("Recorder started");

        Ok(Self {
            shared,
            writer: Mutex::new(Some(writer)),
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.shared.config
    }

    /// Wait for database setup; false if it failed
    pub async fn async_db_ready(&self) -> bool {
        let mut receiver = self.shared.ready.subscribe();
        let ready = match receiver.wait_for(Option::is_some).await {
            Ok(state) => (*state).unwrap_or(false),
            Err(_) => false,
        };
        ready
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> DatabaseHealth {
        self.shared.health()
    }

    /// Tasks waiting for the writer
    pub fn backlog(&self) -> usize {
        self.shared.queue.backlog()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.shared.enabled.store(true, Ordering::SeqCst);
        info!("Recording enabled");
    }

    pub fn disable(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        info!("Recording disabled");
    }

    /// Queue an event unless filters exclude it. Never blocks.
    pub fn record_event(&self, event: Event) -> bool {
        if !self.shared.accepting.load(Ordering::SeqCst) || !self.is_running() {
            return false;
        }
        if !self.shared.filter.should_record(&event) {
            trace!(event_type = %event.event_type, "Event excluded by filter");
            return false;
        }
        self.shared.queue.send(Task::Event(Box::new(event)))
    }

    /// Queue a state change; `new_state == None` records a removal
    pub fn record_state_change(&self, entity_id: EntityId, old_state: Option<State>, new_state: Option<State>) -> bool {
        let (context, fired) = match &new_state {
            Some(state) => (state.context.clone(), state.last_updated),
            None => (Context::new(), Utc::now()),
        };
        let data = StateChangedData {
            entity_id,
            old_state,
            new_state,
        };
        match Event::typed(data, context).fired_at(fired).into_untyped() {
            Ok(event) => self.record_event(event),
            Err(err) => {
                warn!(error = %err, "State change could not be serialized; dropping it");
                false
            }
        }
    }

    /// Queue an arbitrary task
    pub fn queue_task(&self, task: Task) -> bool {
        self.shared.queue.send(task)
    }

    /// Purge rows older than `keep_days`
    pub fn purge(&self, keep_days: u32, repack: bool, apply_filter: bool) -> bool {
        self.queue_task(Task::Purge(PurgeTask {
            purge_before: Utc::now() - Duration::days(i64::from(keep_days)),
            repack,
            apply_filter,
        }))
    }

    /// Purge states of the matching entities older than `keep_days`
    pub fn purge_entities(&self, filter: EntityFilter, keep_days: u32) -> bool {
        self.queue_task(Task::PurgeEntities(PurgeEntitiesTask {
            filter,
            purge_before: Utc::now() - Duration::days(i64::from(keep_days)),
        }))
    }

    /// Validate and queue a statistics import
    pub fn import_statistics(
        &self,
        metadata: StatisticMetaData,
        statistics: Vec<StatisticData>,
        table: StatisticsTable,
    ) -> RecorderResult<()> {
        validate_import(&metadata, &statistics, table)?;
        if !self.queue_task(Task::ImportStatistics(ImportStatisticsTask {
            metadata,
            statistics,
            table,
        })) {
            return Err(RecorderError::NotRunning);
        }
        Ok(())
    }

    /// Grow the dedup caches
    pub fn adjust_lru_size(&self, size: usize) -> bool {
        self.queue_task(Task::AdjustLruSize(size))
    }

    /// Wait until every task queued so far has run. Not for the event loop.
    pub fn block_till_done(&self) -> RecorderResult<()> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(RecorderError::EventLoopAccess);
        }
        let (tx, rx) = oneshot::channel();
        if !self.queue_task(Task::Synchronize(tx)) {
            return Err(RecorderError::NotRunning);
        }
        rx.blocking_recv().map_err(|_| RecorderError::NotRunning)
    }

    /// Wait until every task queued so far has run
    pub async fn async_block_till_done(&self) -> RecorderResult<()> {
        let (tx, rx) = oneshot::channel();
        if !self.queue_task(Task::Synchronize(tx)) {
            return Err(RecorderError::NotRunning);
        }
        rx.await.map_err(|_| RecorderError::NotRunning)
    }

    pub fn is_locked(&self) -> bool {
        self.shared.is_locked()
    }

    /// Freeze writes for an external backup.
    ///
    /// Returns once the writer reached a safe point; `Ok(false)` if the
    /// database is already locked.
    #[instrument(skip(self))]
    pub async fn lock_database(&self) -> RecorderResult<bool> {
        let lock = {
            let mut current = self.shared.db_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|lock| !lock.is_released()) {
                warn!("Database is already locked");
                return Ok(false);
            }
            let lock = DatabaseLock::new();
            *current = Some(lock.clone());
            lock
        };

        let (tx, rx) = oneshot::channel();
        if !self.queue_task(Task::DatabaseLock(LockTask {
            lock: lock.clone(),
            locked: tx,
        })) {
            lock.release();
            return Err(RecorderError::NotRunning);
        }

        match tokio::time::timeout(self.shared.config.tunables.lock_timeout, rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => {
                lock.release();
                Err(RecorderError::NotRunning)
            }
            Err(_) => {
                error!(
                    timeout = ?self.shared.config.tunables.lock_timeout,
                    "Timed out waiting for the writer to lock the database"
                );
                lock.release();
                Err(RecorderError::LockTimeout)
            }
        }
    }

    /// Resume writing. False if not locked or if the lock had already been
    /// released because the queue overflowed.
    pub fn unlock_database(&self) -> bool {
        let lock = self.shared.db_lock.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(lock) = lock else {
            warn!("Database is not locked");
            return false;
        };
        let overflowed = lock.overflowed();
        lock.release();
        // Wake a writer idling in locked mode
        self.queue_task(Task::Commit);
        if overflowed {
            warn!("Database lock had been released early because the queue overflowed");
        }
        !overflowed
    }

    /// Run a read-only job on a blocking worker with its own connection
    pub async fn async_add_executor_job<F, T>(&self, job: F) -> RecorderResult<T>
    where
        F: FnOnce(&Connection) -> RecorderResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            shared.pool.register_worker();
            let conn = shared.pool.acquire()?;
            let conn = lock_connection(&conn);
            job(&conn)
        })
        .await?
    }

    /// Flush, end the run and stop the writer and scheduler
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> RecorderResult<()> {
        if let Some(scheduler) = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner).take() {
            scheduler.stop();
        }
        self.shared.accepting.store(false, Ordering::SeqCst);
        if let Some(lock) = self.shared.db_lock.lock().unwrap_or_else(PoisonError::into_inner).take() {
            lock.release();
        }
        self.queue_task(Task::Stop);

        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            if tokio::task::spawn_blocking(move || writer.join()).await?.is_err() {
                error!("Recorder thread panicked");
            }
        }
        debug!("Recorder shut down");
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            scheduler.stop();
        }
        let Some(writer) = self.writer.get_mut().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        if let Some(lock) = self.shared.db_lock.lock().unwrap_or_else(PoisonError::into_inner).take() {
            lock.release();
        }
        self.shared.queue.send(Task::Stop);
        // Joining would stall the event loop
        if tokio::runtime::Handle::try_current().is_err() && writer.join().is_err() {
            error!("Recorder thread panicked");
        }
    }
}
