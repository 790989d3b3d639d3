//! Tracks the newest state row per entity so new rows can link to it

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OptionalExtension};

use crate::error::RecorderResult;

/// Newest `state_id` per entity, split into rows of the open transaction
/// (pending) and rows known to be durable (committed).
#[derive(Debug, Default)]
pub struct StatesManager {
    pending: HashMap<String, i64>,
    committed: HashMap<String, i64>,
}

impl StatesManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached newest row of `entity_id`, preferring the open transaction
    pub fn latest(&self, entity_id: &str) -> Option<i64> {
        self.pending
            .get(entity_id)
            .or_else(|| self.committed.get(entity_id))
            .copied()
    }

    /// Stop tracking a removed entity
    pub fn forget(&mut self, entity_id: &str) {
        self.pending.remove(entity_id);
        self.committed.remove(entity_id);
    }

    /// Newest stored row for an entity when nothing is cached
    pub fn latest_in_database(conn: &Connection, entity_id: &str) -> RecorderResult<Option<i64>> {
        Ok(conn
            .prepare_cached(
                "SELECT state_id FROM states WHERE entity_id = ?1 \
                 ORDER BY last_updated_ts DESC, state_id DESC LIMIT 1",
            )?
            .query_row([entity_id], |row| row.get(0))
            .optional()?)
    }

    pub fn add_pending(&mut self, entity_id: &str, state_id: i64) {
        self.pending.insert(entity_id.to_string(), state_id);
    }

    pub fn post_commit(&mut self) {
        self.committed.extend(self.pending.drain());
    }

    pub fn reset_pending(&mut self) {
        self.pending.clear();
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.committed.clear();
    }

    pub fn evict_purged_state_ids(&mut self, state_ids: &HashSet<i64>) {
        self.committed.retain(|_, id| !state_ids.contains(&*id));
    }

    pub fn evict_purged_entity_ids(&mut self, entity_ids: &HashSet<String>) {
        self.committed.retain(|entity_id, _| !entity_ids.contains(entity_id));
    }

    pub fn committed_len(&self) -> usize {
        self.committed.len()
    }
}
