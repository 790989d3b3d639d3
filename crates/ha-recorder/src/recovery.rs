//! Detection and quarantine of damaged SQLite files

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{error, info, warn};

use crate::error::{RecorderError, RecorderResult};
use crate::migration::table_exists;
use crate::schema::ALL_TABLES;
use crate::util::ts_to_dt;

/// A run ending longer ago than this was not shut down cleanly
const MAX_RESTART_TIME_MINUTES: i64 = 10;

/// Storage health as seen by the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseHealth {
    Healthy,
    /// The broken file is being moved aside
    Quarantining,
    /// A fresh store is being created
    Reinitializing,
}

impl fmt::Display for DatabaseHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DatabaseHealth::Healthy => "healthy",
            DatabaseHealth::Quarantining => "quarantining",
            DatabaseHealth::Reinitializing => "reinitializing",
        })
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Rename the database and its WAL/SHM files to `<name>.corrupt.<timestamp>`.
///
/// Returns the new database path.
pub fn move_away_broken_database(path: &Path) -> RecorderResult<PathBuf> {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let corrupt = sidecar(path, &format!(".corrupt.{stamp}"));
    error!(
        path = %path.display(),
        moved_to = %corrupt.display(),
        "The database file is corrupt or malformed; moving it aside and starting a new one"
    );

    for suffix in ["", "-wal", "-shm"] {
        let from = sidecar(path, suffix);
        if !from.exists() {
            continue;
        }
        let to = sidecar(&corrupt, suffix);
        std::fs::rename(&from, &to).map_err(|source| RecorderError::Io {
            path: from.clone(),
            source,
        })?;
    }
    Ok(corrupt)
}

/// Read one row from every known table
fn basic_sanity_check(conn: &Connection) -> RecorderResult<()> {
    for table in ALL_TABLES {
        if table_exists(conn, table)? {
            conn.query_row(&format!("SELECT * FROM {table} LIMIT 1"), [], |_| Ok(()))
                .optional()?;
        }
    }
    Ok(())
}

/// Whether the newest run ended too long ago to be a clean shutdown
fn last_run_was_recently_clean(conn: &Connection) -> RecorderResult<bool> {
    if !table_exists(conn, "recorder_runs")? {
        return Ok(true);
    }
    let end: Option<Option<f64>> = conn
        .query_row(
            r#"SELECT "end" FROM recorder_runs ORDER BY start DESC LIMIT 1"#,
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match end {
        None => true,
        Some(None) => false,
        Some(Some(end)) => ts_to_dt(end) + Duration::minutes(MAX_RESTART_TIME_MINUTES) >= Utc::now(),
    })
}

fn validate_sqlite_database(path: &Path) -> RecorderResult<()> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    basic_sanity_check(&conn)?;
    if !last_run_was_recently_clean(&conn)? {
        warn!(
            path = %path.display(),
            "The system could not validate that the database was shutdown cleanly; checking integrity"
        );
        let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if result != "ok" {
            return Err(RecorderError::Integrity(result));
        }
    }
    Ok(())
}

/// Check an existing database file and quarantine it when it is damaged.
///
/// Returns true if the file was moved away.
pub fn validate_or_move_away(path: &Path) -> RecorderResult<bool> {
    if !path.exists() {
        return Ok(false);
    }
    match validate_sqlite_database(path) {
        Ok(()) => Ok(false),
        Err(err) if err.is_corruption() => {
            warn!(path = %path.display(), error = %err, "Database failed validation");
            move_away_broken_database(path)?;
            info!("A new database will be created");
            Ok(true)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::migrate;

    #[test]
    fn test_missing_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!validate_or_move_away(&dir.path().join("none.db")).unwrap());
    }

    #[test]
    fn test_valid_database_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.db");
        let conn = Connection::open(&path).unwrap();
        migrate(&conn).unwrap();
        drop(conn);
        assert!(!validate_or_move_away(&path).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn test_garbage_file_is_moved_away() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.db");
        std::fs::write(&path, vec![0x42u8; 8192]).unwrap();
        std::fs::write(sidecar(&path, "-wal"), b"wal").unwrap();

        assert!(validate_or_move_away(&path).unwrap());
        assert!(!path.exists());
        assert!(!sidecar(&path, "-wal").exists());
        let moved: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(moved.iter().filter(|n| n.contains(".corrupt.")).count(), 2);
    }

    #[test]
    fn test_health_display() {
        assert_eq!(DatabaseHealth::Quarantining.to_string(), "quarantining");
    }
}
