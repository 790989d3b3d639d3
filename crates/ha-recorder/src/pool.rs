//! Thread-confined connection pool
//!
//! Every thread gets its own SQLite connection and keeps getting the same one
//! until [`RecorderPool::shutdown`] is called on that thread. Threads running
//! inside the async runtime are refused unless they registered as recorder
//! workers: database I/O there would stall every producer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use rusqlite::Connection;
use tracing::{debug, error};

use crate::error::{RecorderError, RecorderResult};

/// A connection owned by one thread
pub type PooledConnection = Arc<Mutex<Connection>>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a connection with the pragmas the recorder relies on
pub fn open_connection(path: &Path) -> RecorderResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // journal_mode answers with the mode that is now active
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", -16384)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

/// Lock a pooled connection, recovering from a poisoned mutex
pub fn lock_connection(conn: &PooledConnection) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connections keyed by the thread that opened them
#[derive(Debug)]
pub struct RecorderPool {
    path: PathBuf,
    connections: DashMap<ThreadId, PooledConnection>,
    workers: DashSet<ThreadId>,
}

impl RecorderPool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connections: DashMap::new(),
            workers: DashSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the calling thread as a recorder worker
    pub fn register_worker(&self) {
        self.workers.insert(thread::current().id());
    }

    /// The calling thread's connection, opened on first use
    pub fn acquire(&self) -> RecorderResult<PooledConnection> {
        let id = thread::current().id();

        if !self.workers.contains(&id) && tokio::runtime::Handle::try_current().is_ok() {
            error!(
                thread = ?thread::current().name(),
                "Detected unsafe call not using the recorder executor; database I/O must not run in the event loop"
            );
            return Err(RecorderError::EventLoopAccess);
        }

        if let Some(conn) = self.connections.get(&id) {
            return Ok(conn.clone());
        }

        let conn = Arc::new(Mutex::new(open_connection(&self.path)?));
        self.connections.insert(id, conn.clone());
        debug!(thread = ?id, path = %self.path.display(), "Opened pooled connection");
        Ok(conn)
    }

    /// Drop the calling thread's connection; the next acquire opens a fresh one
    pub fn shutdown(&self) {
        if self.connections.remove(&thread::current().id()).is_some() {
            debug!("Closed pooled connection for current thread");
        }
    }

    /// Drop every connection
    pub fn dispose(&self) {
        self.connections.clear();
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> (tempfile::TempDir, Arc<RecorderPool>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(RecorderPool::new(dir.path().join("pool.db")));
        (dir, pool)
    }

    #[test]
    fn test_same_thread_gets_same_connection() {
        let (_dir, pool) = pool();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_threads_get_distinct_connections() {
        let (_dir, pool) = pool();
        let mine = pool.acquire().unwrap();
        let other = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().unwrap()).join().unwrap()
        };
        assert!(!Arc::ptr_eq(&mine, &other));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_shutdown_yields_fresh_connection() {
        let (_dir, pool) = pool();
        let before = pool.acquire().unwrap();
        pool.shutdown();
        assert!(pool.is_empty());
        let after = pool.acquire().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_connection_uses_wal() {
        let (_dir, pool) = pool();
        let conn = pool.acquire().unwrap();
        let conn = lock_connection(&conn);
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[tokio::test]
    async fn test_event_loop_is_refused() {
        let (_dir, pool) = pool();
        assert!(matches!(pool.acquire(), Err(RecorderError::EventLoopAccess)));
    }

    #[tokio::test]
    async fn test_registered_worker_is_allowed() {
        let (_dir, pool) = pool();
        let worker = pool.clone();
        let ok = tokio::task::spawn_blocking(move || {
            worker.register_worker();
            worker.acquire().is_ok()
        })
        .await
        .unwrap();
        assert!(ok);
    }
}
