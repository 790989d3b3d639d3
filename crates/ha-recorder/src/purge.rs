//! Retention: batched deletion of old rows
//!
//! One call runs at most `purge_batches_per_task` batches. Each batch selects
//! at most `purge_batch_size` candidates per table, strictly older than the
//! cutoff, and deletes children before the shared payloads they reference.
//! A call reports `finished` only once a batch finds nothing to delete; the
//! writer re-queues unfinished purges behind the work that arrived meanwhile.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, ToSql};
use tracing::{debug, info, instrument};

use crate::config::RecorderTunables;
use crate::error::RecorderResult;
use crate::filters::{EntityFilter, EventFilter};
use crate::migration::{drop_legacy_events_index, has_used_states_event_ids};
use crate::util::{dt_to_ts, placeholders};

/// Rows removed by one purge call and whether the purge is complete
#[derive(Debug, Default)]
pub struct PurgeOutcome {
    pub finished: bool,
    pub state_ids: HashSet<i64>,
    pub attributes_ids: HashSet<i64>,
    pub event_ids: HashSet<i64>,
    pub data_ids: HashSet<i64>,
    /// Entities whose states were removed regardless of age
    pub entity_ids: HashSet<String>,
    /// The legacy event linkage was retired during this call
    pub legacy_index_dropped: bool,
}

impl PurgeOutcome {
    fn rows(&self) -> usize {
        self.state_ids.len() + self.attributes_ids.len() + self.event_ids.len() + self.data_ids.len()
    }
}

/// Parameters shared by every batch of one purge call
pub struct PurgeContext<'a> {
    pub purge_before: DateTime<Utc>,
    pub tunables: &'a RecorderTunables,
    pub active_run_id: Option<i64>,
    /// States still link to events through `event_id`
    pub legacy: bool,
}

impl PurgeContext<'_> {
    /// Candidates selected per table and batch, never zero
    fn batch_size(&self) -> usize {
        self.tunables.purge_batch_size.max(1)
    }
}

fn query_ids<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> RecorderResult<Vec<i64>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Distinct entity ids that have states
fn entity_ids_with_states(conn: &Connection) -> RecorderResult<Vec<String>> {
    let mut stmt = conn.prepare_cached("SELECT DISTINCT entity_id FROM states WHERE entity_id IS NOT NULL")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn execute_in<T: ToSql>(conn: &Connection, sql_prefix: &str, ids: &[T]) -> RecorderResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!("{sql_prefix} ({})", placeholders(ids.len()));
    Ok(conn.execute(&sql, params_from_iter(ids))?)
}

fn select_in(conn: &Connection, sql_prefix: &str, ids: &[i64]) -> RecorderResult<HashSet<i64>> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }
    let sql = format!("{sql_prefix} ({})", placeholders(ids.len()));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(ids), |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Delete the given states, unlinking rows that point at them first
fn delete_states(conn: &Connection, state_ids: &[i64], outcome: &mut PurgeOutcome) -> RecorderResult<Vec<i64>> {
    if state_ids.is_empty() {
        return Ok(Vec::new());
    }
    let attributes_ids: Vec<i64> = select_in(
        conn,
        "SELECT DISTINCT attributes_id FROM states WHERE attributes_id IS NOT NULL AND state_id IN",
        state_ids,
    )?
    .into_iter()
    .collect();
    execute_in(conn, "UPDATE states SET old_state_id = NULL WHERE old_state_id IN", state_ids)?;
    let deleted = execute_in(conn, "DELETE FROM states WHERE state_id IN", state_ids)?;
    debug!(deleted, "Deleted states");
    outcome.state_ids.extend(state_ids);
    Ok(attributes_ids)
}

/// Delete shared attribute rows no state references any more
fn delete_unused_attributes(conn: &Connection, candidates: &[i64], outcome: &mut PurgeOutcome) -> RecorderResult<()> {
    let in_use = select_in(
        conn,
        "SELECT DISTINCT attributes_id FROM states WHERE attributes_id IN",
        candidates,
    )?;
    let unused: Vec<i64> = candidates.iter().copied().filter(|id| !in_use.contains(id)).collect();
    let deleted = execute_in(conn, "DELETE FROM state_attributes WHERE attributes_id IN", &unused)?;
    debug!(deleted, "Deleted unused state attributes");
    outcome.attributes_ids.extend(unused);
    Ok(())
}

fn delete_events(conn: &Connection, event_ids: &[i64], legacy: bool, outcome: &mut PurgeOutcome) -> RecorderResult<Vec<i64>> {
    if event_ids.is_empty() {
        return Ok(Vec::new());
    }
    let data_ids: Vec<i64> = select_in(
        conn,
        "SELECT DISTINCT data_id FROM events WHERE data_id IS NOT NULL AND event_id IN",
        event_ids,
    )?
    .into_iter()
    .collect();
    if legacy {
        execute_in(conn, "UPDATE states SET event_id = NULL WHERE event_id IN", event_ids)?;
    }
    let deleted = execute_in(conn, "DELETE FROM events WHERE event_id IN", event_ids)?;
    debug!(deleted, "Deleted events");
    outcome.event_ids.extend(event_ids);
    Ok(data_ids)
}

fn delete_unused_data(conn: &Connection, candidates: &[i64], outcome: &mut PurgeOutcome) -> RecorderResult<()> {
    let in_use = select_in(conn, "SELECT DISTINCT data_id FROM events WHERE data_id IN", candidates)?;
    let unused: Vec<i64> = candidates.iter().copied().filter(|id| !in_use.contains(id)).collect();
    let deleted = execute_in(conn, "DELETE FROM event_data WHERE data_id IN", &unused)?;
    debug!(deleted, "Deleted unused event data");
    outcome.data_ids.extend(unused);
    Ok(())
}

/// States and events older than the cutoff, linked through the event table
fn purge_legacy_batch(conn: &Connection, ctx: &PurgeContext<'_>, outcome: &mut PurgeOutcome) -> RecorderResult<usize> {
    let cutoff = dt_to_ts(ctx.purge_before);
    let limit = ctx.batch_size() as i64;

    let event_ids = query_ids(
        conn,
        "SELECT event_id FROM events WHERE time_fired_ts < ?1 LIMIT ?2",
        params![cutoff, limit],
    )?;
    let mut state_ids: Vec<i64> = select_in(conn, "SELECT state_id FROM states WHERE event_id IN", &event_ids)?
        .into_iter()
        .collect();
    // States that never had an event row
    state_ids.extend(query_ids(
        conn,
        "SELECT state_id FROM states WHERE last_updated_ts < ?1 AND event_id IS NULL LIMIT ?2",
        params![cutoff, limit],
    )?);

    let attributes_ids = delete_states(conn, &state_ids, outcome)?;
    delete_unused_attributes(conn, &attributes_ids, outcome)?;
    let data_ids = delete_events(conn, &event_ids, true, outcome)?;
    delete_unused_data(conn, &data_ids, outcome)?;
    Ok(state_ids.len() + event_ids.len())
}

fn purge_states_batch(conn: &Connection, ctx: &PurgeContext<'_>, outcome: &mut PurgeOutcome) -> RecorderResult<usize> {
    let state_ids = query_ids(
        conn,
        "SELECT state_id FROM states WHERE last_updated_ts < ?1 LIMIT ?2",
        params![dt_to_ts(ctx.purge_before), ctx.batch_size() as i64],
    )?;
    let attributes_ids = delete_states(conn, &state_ids, outcome)?;
    delete_unused_attributes(conn, &attributes_ids, outcome)?;
    Ok(state_ids.len())
}

fn purge_events_batch(conn: &Connection, ctx: &PurgeContext<'_>, outcome: &mut PurgeOutcome) -> RecorderResult<usize> {
    let event_ids = query_ids(
        conn,
        "SELECT event_id FROM events WHERE time_fired_ts < ?1 LIMIT ?2",
        params![dt_to_ts(ctx.purge_before), ctx.batch_size() as i64],
    )?;
    let data_ids = delete_events(conn, &event_ids, false, outcome)?;
    delete_unused_data(conn, &data_ids, outcome)?;
    Ok(event_ids.len())
}

/// Short-term statistics, statistics runs and recorder runs
fn purge_bookkeeping_batch(conn: &Connection, ctx: &PurgeContext<'_>) -> RecorderResult<usize> {
    let cutoff = dt_to_ts(ctx.purge_before);
    let limit = ctx.batch_size() as i64;

    let short_term = conn.execute(
        "DELETE FROM statistics_short_term WHERE id IN \
         (SELECT id FROM statistics_short_term WHERE start_ts < ?1 LIMIT ?2)",
        params![cutoff, limit],
    )?;
    // The newest statistics run marks where compilation resumes
    let statistics_runs = conn.execute(
        "DELETE FROM statistics_runs WHERE run_id IN \
         (SELECT run_id FROM statistics_runs WHERE start < ?1 AND run_id != \
          (SELECT run_id FROM statistics_runs ORDER BY start DESC LIMIT 1) LIMIT ?2)",
        params![cutoff, limit],
    )?;
    let recorder_runs = conn.execute(
        r#"DELETE FROM recorder_runs WHERE run_id IN
           (SELECT run_id FROM recorder_runs WHERE start < ?1 AND "end" IS NOT NULL AND run_id != ?2 LIMIT ?3)"#,
        params![cutoff, ctx.active_run_id.unwrap_or(-1), limit],
    )?;
    debug!(short_term, statistics_runs, recorder_runs, "Deleted bookkeeping rows");
    Ok(short_term + statistics_runs + recorder_runs)
}

/// States of entities the recorder no longer records, and excluded event
/// types, regardless of age
fn purge_filtered_batch(
    conn: &Connection,
    filter: &EventFilter,
    ctx: &PurgeContext<'_>,
    outcome: &mut PurgeOutcome,
) -> RecorderResult<usize> {
    let limit = ctx.batch_size();

    let excluded_entities: Vec<String> = entity_ids_with_states(conn)?
        .into_iter()
        .filter(|entity_id| !filter.accepts_entity(entity_id))
        .collect();
    let mut removed = 0;
    for chunk in excluded_entities.chunks(limit) {
        let sql = format!(
            "SELECT state_id FROM states WHERE entity_id IN ({}) LIMIT {limit}",
            placeholders(chunk.len())
        );
        let state_ids = query_ids(conn, &sql, params_from_iter(chunk))?;
        if state_ids.is_empty() {
            continue;
        }
        let attributes_ids = delete_states(conn, &state_ids, outcome)?;
        delete_unused_attributes(conn, &attributes_ids, outcome)?;
        outcome.entity_ids.extend(chunk.iter().cloned());
        removed += state_ids.len();
        break;
    }

    let excluded_types: Vec<&String> = filter.excluded_event_types().iter().collect();
    if removed == 0 && !excluded_types.is_empty() {
        let sql = format!(
            "SELECT event_id FROM events WHERE event_type IN ({}) LIMIT {limit}",
            placeholders(excluded_types.len())
        );
        let event_ids = query_ids(conn, &sql, params_from_iter(&excluded_types))?;
        let data_ids = delete_events(conn, &event_ids, ctx.legacy, outcome)?;
        delete_unused_data(conn, &data_ids, outcome)?;
        removed += event_ids.len();
    }
    Ok(removed)
}

/// Delete rows older than the cutoff, optionally followed by rows the
/// current filters exclude.
#[instrument(skip_all, fields(purge_before = %ctx.purge_before, legacy = ctx.legacy))]
pub fn purge_old_data(
    conn: &Connection,
    ctx: &PurgeContext<'_>,
    apply_filter: Option<&EventFilter>,
) -> RecorderResult<PurgeOutcome> {
    let mut outcome = PurgeOutcome::default();

    for _ in 0..ctx.tunables.purge_batches_per_task.max(1) {
        let tx = conn.unchecked_transaction()?;
        let mut removed = if ctx.legacy {
            purge_legacy_batch(&tx, ctx, &mut outcome)?
        } else {
            purge_states_batch(&tx, ctx, &mut outcome)? + purge_events_batch(&tx, ctx, &mut outcome)?
        };
        removed += purge_bookkeeping_batch(&tx, ctx)?;
        if removed == 0 {
            if let Some(filter) = apply_filter {
                removed += purge_filtered_batch(&tx, filter, ctx, &mut outcome)?;
            }
        }
        tx.commit()?;

        if removed == 0 {
            outcome.finished = true;
            break;
        }
    }

    if outcome.finished && ctx.legacy && !has_used_states_event_ids(conn)? {
        drop_legacy_events_index(conn)?;
        outcome.legacy_index_dropped = true;
    }

    debug!(finished = outcome.finished, rows = outcome.rows(), "Purge pass done");
    Ok(outcome)
}

/// Delete states of the matching entities older than the cutoff
#[instrument(skip_all, fields(purge_before = %ctx.purge_before))]
pub fn purge_entity_data(
    conn: &Connection,
    entity_filter: &EntityFilter,
    ctx: &PurgeContext<'_>,
) -> RecorderResult<PurgeOutcome> {
    let mut outcome = PurgeOutcome::default();
    let cutoff = dt_to_ts(ctx.purge_before);
    let limit = ctx.batch_size();

    let entity_ids: Vec<String> = entity_ids_with_states(conn)?
        .into_iter()
        .filter(|entity_id| entity_filter.accepts(entity_id))
        .collect();
    if entity_ids.is_empty() {
        outcome.finished = true;
        return Ok(outcome);
    }

    for _ in 0..ctx.tunables.purge_batches_per_task.max(1) {
        let tx = conn.unchecked_transaction()?;
        let mut removed = 0;
        for chunk in entity_ids.chunks(limit) {
            let sql = format!(
                "SELECT state_id FROM states WHERE last_updated_ts < ? AND entity_id IN ({}) LIMIT {limit}",
                placeholders(chunk.len())
            );
            let mut bound: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() + 1);
            bound.push(&cutoff);
            bound.extend(chunk.iter().map(|id| id as &dyn ToSql));
            let state_ids = query_ids(&tx, &sql, bound.as_slice())?;
            let attributes_ids = delete_states(&tx, &state_ids, &mut outcome)?;
            delete_unused_attributes(&tx, &attributes_ids, &mut outcome)?;
            removed += state_ids.len();
        }
        tx.commit()?;
        if removed == 0 {
            outcome.finished = true;
            break;
        }
    }

    info!(
        entities = entity_ids.len(),
        states = outcome.state_ids.len(),
        finished = outcome.finished,
        "Purged entity states"
    );
    Ok(outcome)
}

/// WAL checkpoint and planner statistics refresh
pub fn periodic_db_cleanups(conn: &Connection) -> RecorderResult<()> {
    debug!("Running periodic database cleanups");
    // wal_checkpoint reports (busy, log frames, checkpointed frames)
    let _: (i64, i64, i64) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })?;
    conn.execute_batch("PRAGMA optimize")?;
    Ok(())
}

/// Reclaim free pages
pub fn repack(conn: &Connection) -> RecorderResult<()> {
    info!("Vacuuming database to free space");
    conn.execute_batch("VACUUM")?;
    Ok(())
}
