//! Tasks consumed by the writer thread, and the queue that carries them

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ha_core::Event;
use tokio::sync::oneshot;

use crate::filters::EntityFilter;
use crate::statistics::{StatisticData, StatisticMetaData, StatisticsTable};

/// Unit of work for the writer thread
#[derive(Debug)]
pub enum Task {
    /// Record an event (state changes become `states` rows)
    Event(Box<Event>),
    /// Commit buffered writes
    Commit,
    /// Keep a socket connection alive
    KeepAlive,
    /// Purge rows older than `purge_before`
    Purge(PurgeTask),
    /// Purge states of matching entities older than `purge_before`
    PurgeEntities(PurgeEntitiesTask),
    /// WAL checkpoint and planner optimization
    PeriodicCleanup,
    /// Compile the five-minute period starting at `start`
    Statistics { start: DateTime<Utc> },
    /// Compile periods missed while the recorder was not running
    CompileMissingStatistics,
    ImportStatistics(ImportStatisticsTask),
    /// Grow the dedup caches
    AdjustLruSize(usize),
    /// Enter locked mode for an external backup
    DatabaseLock(LockTask),
    /// Completes once every earlier task has run
    Synchronize(oneshot::Sender<()>),
    Stop,
}

impl Task {
    /// Whether buffered writes must be committed before the task runs
    pub fn commit_before(&self) -> bool {
        !matches!(
            self,
            Task::Event(_) | Task::Commit | Task::KeepAlive | Task::Stop | Task::DatabaseLock(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::Event(_) => "event",
            Task::Commit => "commit",
            Task::KeepAlive => "keep_alive",
            Task::Purge(_) => "purge",
            Task::PurgeEntities(_) => "purge_entities",
            Task::PeriodicCleanup => "periodic_cleanup",
            Task::Statistics { .. } => "statistics",
            Task::CompileMissingStatistics => "compile_missing_statistics",
            Task::ImportStatistics(_) => "import_statistics",
            Task::AdjustLruSize(_) => "adjust_lru_size",
            Task::DatabaseLock(_) => "database_lock",
            Task::Synchronize(_) => "synchronize",
            Task::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PurgeTask {
    pub purge_before: DateTime<Utc>,
    pub repack: bool,
    pub apply_filter: bool,
}

#[derive(Debug, Clone)]
pub struct PurgeEntitiesTask {
    pub filter: EntityFilter,
    pub purge_before: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ImportStatisticsTask {
    pub metadata: StatisticMetaData,
    pub statistics: Vec<StatisticData>,
    pub table: StatisticsTable,
}

/// Shared state of one lock/unlock cycle
#[derive(Debug, Default)]
pub struct DatabaseLock {
    released: Mutex<bool>,
    cond: Condvar,
    overflow: AtomicBool,
}

impl DatabaseLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        *released = true;
        self.cond.notify_all();
    }

    /// Release because the queue grew past the backlog limit
    pub fn release_on_overflow(&self) {
        self.overflow.store(true, Ordering::SeqCst);
        self.release();
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for release; true once released
    pub fn wait_released(&self, timeout: Duration) -> bool {
        let released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        let (released, _) = self
            .cond
            .wait_timeout_while(released, timeout, |released| !*released)
            .unwrap_or_else(PoisonError::into_inner);
        *released
    }
}

#[derive(Debug)]
pub struct LockTask {
    pub lock: Arc<DatabaseLock>,
    /// Signalled once the writer is in locked mode
    pub locked: oneshot::Sender<()>,
}

/// Producer side of the writer queue
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    backlog: Arc<AtomicUsize>,
}

impl TaskQueue {
    /// Enqueue without blocking; false once the writer is gone
    pub fn send(&self, task: Task) -> bool {
        self.backlog.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(task).is_err() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Tasks waiting in the queue
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }
}

/// Writer side of the queue
#[derive(Debug)]
pub struct TaskReceiver {
    rx: mpsc::Receiver<Task>,
    backlog: Arc<AtomicUsize>,
}

impl TaskReceiver {
    pub fn recv(&self) -> Option<Task> {
        let task = self.rx.recv().ok()?;
        self.backlog.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Task, RecvTimeoutError> {
        let task = self.rx.recv_timeout(timeout)?;
        self.backlog.fetch_sub(1, Ordering::SeqCst);
        Ok(task)
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }
}

/// Unbounded FIFO between producers and the writer
pub fn task_queue() -> (TaskQueue, TaskReceiver) {
    let (tx, rx) = mpsc::channel();
    let backlog = Arc::new(AtomicUsize::new(0));
    (
        TaskQueue {
            tx,
            backlog: backlog.clone(),
        },
        TaskReceiver { rx, backlog },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_commit_before_flags() {
        let (tx, _rx) = oneshot::channel();
        assert!(!Task::Commit.commit_before());
        assert!(!Task::KeepAlive.commit_before());
        assert!(!Task::Stop.commit_before());
        assert!(!Task::Event(Box::new(Event::new("x", serde_json::Value::Null, Default::default())))
            .commit_before());
        assert!(!Task::DatabaseLock(LockTask {
            lock: DatabaseLock::new(),
            locked: tx,
        })
        .commit_before());
        assert!(Task::PeriodicCleanup.commit_before());
        assert!(Task::CompileMissingStatistics.commit_before());
        let (tx, _rx) = oneshot::channel();
        assert!(Task::Synchronize(tx).commit_before());
    }

    #[test]
    fn test_queue_is_fifo_and_tracks_backlog() {
        let (queue, receiver) = task_queue();
        assert!(queue.send(Task::Commit));
        assert!(queue.send(Task::KeepAlive));
        assert_eq!(queue.backlog(), 2);
        assert_eq!(receiver.recv().map(|t| t.name()), Some("commit"));
        assert_eq!(receiver.recv().map(|t| t.name()), Some("keep_alive"));
        assert_eq!(receiver.backlog(), 0);
        assert!(matches!(
            receiver.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        ));
        drop(queue);
        assert!(matches!(
            receiver.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (queue, receiver) = task_queue();
        drop(receiver);
        assert!(!queue.send(Task::Commit));
        assert_eq!(queue.backlog(), 0);
    }

    #[test]
    fn test_lock_release_wakes_waiter() {
        let lock = DatabaseLock::new();
        assert!(!lock.wait_released(Duration::from_millis(10)));
        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || lock.wait_released(Duration::from_secs(5)))
        };
        lock.release();
        assert!(waiter.join().unwrap());
        assert!(!lock.overflowed());

        let lock = DatabaseLock::new();
        lock.release_on_overflow();
        assert!(lock.is_released());
        assert!(lock.overflowed());
    }
}
