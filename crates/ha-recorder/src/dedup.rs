//! Content-addressed payload caches
//!
//! `event_data` and `state_attributes` rows are shared by every event/state
//! carrying the same payload. Each table has a [`DedupCache`]: a bounded LRU
//! of committed `payload -> row id` mappings plus the mappings created inside
//! the open transaction, which only become trustworthy after COMMIT.
//!
//! The cache is a hint. On a miss the table is searched by hash and the
//! payload compared for equality, so eviction costs a query, never a
//! duplicate row.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::trace;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::RecorderResult;

/// A content-addressed blob table
#[derive(Debug)]
pub struct BlobTable {
    pub table: &'static str,
    pub id_column: &'static str,
    pub payload_column: &'static str,
}

pub const EVENT_DATA: BlobTable = BlobTable {
    table: "event_data",
    id_column: "data_id",
    payload_column: "shared_data",
};

pub const STATE_ATTRIBUTES: BlobTable = BlobTable {
    table: "state_attributes",
    id_column: "attributes_id",
    payload_column: "shared_attrs",
};

/// XXH3-64 of a canonical JSON payload, reinterpreted as SQLite INTEGER
pub fn payload_hash(payload: &str) -> i64 {
    xxh3_64(payload.as_bytes()) as i64
}

pub struct DedupCache {
    table: &'static BlobTable,
    committed: LruCache<String, i64>,
    pending: HashMap<String, i64>,
    select_sql: String,
    insert_sql: String,
}

impl DedupCache {
    pub fn new(table: &'static BlobTable, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            table,
            committed: LruCache::new(capacity),
            pending: HashMap::new(),
            select_sql: format!(
                "SELECT {id} FROM {table} WHERE hash = ?1 AND {payload} = ?2 LIMIT 1",
                id = table.id_column,
                table = table.table,
                payload = table.payload_column,
            ),
            insert_sql: format!(
                "INSERT INTO {table} (hash, {payload}) VALUES (?1, ?2)",
                table = table.table,
                payload = table.payload_column,
            ),
        }
    }

    /// Row id for `payload`, inserting a row when no equal payload exists.
    ///
    /// Must run inside the writer's open transaction.
    pub fn lookup_or_insert(&mut self, conn: &Connection, payload: &str) -> RecorderResult<i64> {
        if let Some(id) = self.pending.get(payload) {
            return Ok(*id);
        }
        if let Some(id) = self.committed.get(payload) {
            return Ok(*id);
        }

        let hash = payload_hash(payload);
        let existing: Option<i64> = conn
            .prepare_cached(&self.select_sql)?
            .query_row(params![hash, payload], |row| row.get(0))
            .optional()?;
        if let Some(id) = existing {
            trace!(table = self.table.table, id, "Found shared payload in database");
            self.committed.put(payload.to_string(), id);
            return Ok(id);
        }

        let id = conn
            .prepare_cached(&self.insert_sql)?
            .insert(params![hash, payload])?;
        self.pending.insert(payload.to_string(), id);
        Ok(id)
    }

    /// Promote rows from the committed transaction
    pub fn post_commit(&mut self) {
        for (payload, id) in self.pending.drain() {
            self.committed.put(payload, id);
        }
    }

    /// Forget rows from a rolled back transaction
    pub fn reset_pending(&mut self) {
        self.pending.clear();
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.committed.clear();
    }

    /// Drop entries whose rows were purged
    pub fn evict_purged(&mut self, ids: &HashSet<i64>) {
        if ids.is_empty() {
            return;
        }
        let stale: Vec<String> = self
            .committed
            .iter()
            .filter(|(_, id)| ids.contains(*id))
            .map(|(payload, _)| payload.clone())
            .collect();
        for payload in stale {
            self.committed.pop(&payload);
        }
        self.pending.retain(|_, id| !ids.contains(&*id));
    }

    /// Grow the LRU; shrinking requests are ignored
    pub fn resize(&mut self, capacity: usize) {
        if let Some(capacity) = NonZeroUsize::new(capacity) {
            if capacity > self.committed.cap() {
                self.committed.resize(capacity);
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.committed.cap().get()
    }

    pub fn len(&self) -> usize {
        self.committed.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
