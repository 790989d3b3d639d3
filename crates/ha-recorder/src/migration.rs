//! Schema creation and versioned migrations
//!
//! A fresh database gets the current schema in one step. Existing databases
//! are brought forward one version at a time, each step in its own
//! transaction together with its `schema_changes` row.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{RecorderError, RecorderResult};
use crate::schema::{
    CORE_TABLES_SQL, LEGACY_STATES_EVENT_ID_INDEX, PURGE_INDEXES_SQL, SCHEMA_VERSION,
    STATISTICS_TABLES_SQL, TABLE_SCHEMA_CHANGES, TABLE_STATES,
};
use crate::statistics::get_start_time;
use crate::util::dt_to_ts;

/// Ordered migration steps: (target version, DDL)
const MIGRATIONS: &[(i64, &str)] = &[(2, STATISTICS_TABLES_SQL), (3, PURGE_INDEXES_SQL)];

/// What [`migrate`] found and did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    /// New database created at the current version
    Created,
    /// Already current
    Current,
    /// Upgraded from an older version
    Migrated { from: i64 },
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> RecorderResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn index_exists(conn: &Connection, index: &str) -> RecorderResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [index],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Latest recorded schema version.
///
/// `None` for an empty database. A database with tables but without a
/// `schema_changes` table predates version tracking and counts as version 1.
pub fn get_schema_version(conn: &Connection) -> RecorderResult<Option<i64>> {
    if !table_exists(conn, TABLE_SCHEMA_CHANGES)? {
        return Ok(table_exists(conn, TABLE_STATES)?.then_some(1));
    }
    let version: Option<i64> = conn.query_row(
        "SELECT MAX(schema_version) FROM schema_changes",
        [],
        |row| row.get(0),
    )?;
    Ok(Some(version.unwrap_or(1)))
}

fn record_version(conn: &Connection, version: i64) -> RecorderResult<()> {
    conn.execute(
        "INSERT INTO schema_changes (schema_version, changed) VALUES (?1, ?2)",
        params![version, dt_to_ts(Utc::now())],
    )?;
    Ok(())
}

fn initialize_schema(conn: &Connection) -> RecorderResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(CORE_TABLES_SQL)?;
    tx.execute_batch(STATISTICS_TABLES_SQL)?;
    tx.execute_batch(PURGE_INDEXES_SQL)?;
    record_version(&tx, SCHEMA_VERSION)?;
    // Nothing to catch up on in a new database
    tx.execute(
        "INSERT INTO statistics_runs (start) VALUES (?1)",
        [dt_to_ts(get_start_time(Utc::now()))],
    )?;
    tx.commit()?;
    Ok(())
}

/// Create or upgrade the schema. Runs before the writer accepts tasks.
pub fn migrate(conn: &Connection) -> RecorderResult<SchemaStatus> {
    let Some(current) = get_schema_version(conn)? else {
        info!(version = SCHEMA_VERSION, "Creating new database schema");
        initialize_schema(conn)?;
        return Ok(SchemaStatus::Created);
    };

    if current > SCHEMA_VERSION {
        return Err(RecorderError::Schema(format!(
            "database schema version {current} is newer than the supported version {SCHEMA_VERSION}"
        )));
    }
    if current == SCHEMA_VERSION {
        debug!(version = current, "Database schema is current");
        return Ok(SchemaStatus::Current);
    }

    warn!(
        from = current,
        to = SCHEMA_VERSION,
        "Database is about to upgrade; this may take a while"
    );
    if !table_exists(conn, TABLE_SCHEMA_CHANGES)? {
        conn.execute_batch(CORE_TABLES_SQL)?;
    }
    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        record_version(&tx, *version)?;
        tx.commit()?;
        info!(version, "Upgraded database schema");
    }
    Ok(SchemaStatus::Migrated { from: current })
}

/// Whether states still reference events through the legacy index
pub fn has_legacy_events_index(conn: &Connection) -> RecorderResult<bool> {
    index_exists(conn, LEGACY_STATES_EVENT_ID_INDEX)
}

/// Whether any state row still points at an event
pub fn has_used_states_event_ids(conn: &Connection) -> RecorderResult<bool> {
    let used = conn
        .query_row(
            "SELECT 1 FROM states WHERE event_id IS NOT NULL LIMIT 1",
            [],
            |_| Ok(()),
        )
        .optional()?;
    Ok(used.is_some())
}

pub fn drop_legacy_events_index(conn: &Connection) -> RecorderResult<()> {
    conn.execute_batch(&format!("DROP INDEX IF EXISTS {LEGACY_STATES_EVENT_ID_INDEX}"))?;
    info!(index = LEGACY_STATES_EVENT_ID_INDEX, "Dropped legacy index");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ALL_TABLES;

    #[test]
    fn test_fresh_database_gets_current_schema() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), None);
        assert_eq!(migrate(&conn).unwrap(), SchemaStatus::Created);
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        for table in ALL_TABLES {
            assert!(table_exists(&conn, table).unwrap(), "{table} missing");
        }
        assert!(!has_legacy_events_index(&conn).unwrap());
        let runs: i64 = conn
            .query_row("SELECT COUNT(*) FROM statistics_runs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(runs, 1);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(migrate(&conn).unwrap(), SchemaStatus::Current);
    }

    #[test]
    fn test_upgrade_from_version_one() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CORE_TABLES_SQL).unwrap();
        conn.execute_batch("CREATE INDEX ix_states_event_id ON states(event_id);")
            .unwrap();
        record_version(&conn, 1).unwrap();

        assert_eq!(migrate(&conn).unwrap(), SchemaStatus::Migrated { from: 1 });
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(table_exists(&conn, "statistics_short_term").unwrap());
        assert!(index_exists(&conn, "ix_states_old_state_id").unwrap());
        // Legacy linkage survives until a purge proves it unused
        assert!(has_legacy_events_index(&conn).unwrap());
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        record_version(&conn, SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(migrate(&conn), Err(RecorderError::Schema(_))));
    }
}
