//! Long- and short-term statistics
//!
//! Every five minutes the states of entities whose attributes carry a
//! `state_class` are compiled into `statistics_short_term`:
//!
//! - `measurement`: time-weighted mean plus min and max
//! - `total` / `total_increasing`: last state and a running sum; a decrease
//!   of a `total_increasing` sensor is a meter reset
//!
//! The period starting at minute 55 also rolls the hour up into
//! `statistics`. A `statistics_runs` row per compiled period makes
//! compilation idempotent and lets a restarted recorder catch up.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Timelike, Utc};
use ha_core::EntityId;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{RecorderError, RecorderResult};
use crate::util::{dt_to_ts, ts_to_dt};

/// Length of a short-term statistics period
pub const PERIOD_SECONDS: i64 = 5 * 60;

/// Source of statistics compiled from recorded states
pub const RECORDER_SOURCE: &str = "recorder";

const ATTR_STATE_CLASS: &str = "state_class";
const ATTR_UNIT_OF_MEASUREMENT: &str = "unit_of_measurement";

/// Target table of compiled or imported statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticsTable {
    Hourly,
    ShortTerm,
}

impl StatisticsTable {
    pub fn table_name(self) -> &'static str {
        match self {
            StatisticsTable::Hourly => "statistics",
            StatisticsTable::ShortTerm => "statistics_short_term",
        }
    }

    fn period_seconds(self) -> i64 {
        match self {
            StatisticsTable::Hourly => 3600,
            StatisticsTable::ShortTerm => PERIOD_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticMetaData {
    pub statistic_id: String,
    pub source: String,
    #[serde(default)]
    pub unit_of_measurement: Option<String>,
    #[serde(default)]
    pub has_mean: bool,
    #[serde(default)]
    pub has_sum: bool,
    #[serde(default)]
    pub name: Option<String>,
}

/// One statistics row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticData {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub mean: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub last_reset: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: Option<f64>,
    #[serde(default)]
    pub sum: Option<f64>,
}

impl StatisticData {
    fn empty(start: DateTime<Utc>) -> Self {
        Self {
            start,
            mean: None,
            min: None,
            max: None,
            last_reset: None,
            state: None,
            sum: None,
        }
    }
}

fn floor_to(dt: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(seconds), 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Start of the last completed five-minute period
pub fn get_start_time(now: DateTime<Utc>) -> DateTime<Utc> {
    floor_to(now, PERIOD_SECONDS) - Duration::seconds(PERIOD_SECONDS)
}

/// `domain.object_id` (recorder) or `domain:object_id` (external)
pub fn valid_statistic_id(statistic_id: &str) -> bool {
    match statistic_id.split_once(':') {
        Some((domain, object_id)) => !object_id.contains(':')
            && EntityId::new(domain, object_id).is_ok(),
        None => statistic_id.parse::<EntityId>().is_ok(),
    }
}

/// Check an import before it is queued
pub fn validate_import(
    metadata: &StatisticMetaData,
    statistics: &[StatisticData],
    table: StatisticsTable,
) -> RecorderResult<()> {
    let invalid = |reason: &str| RecorderError::InvalidStatistic {
        statistic_id: metadata.statistic_id.clone(),
        reason: reason.to_string(),
    };

    if !valid_statistic_id(&metadata.statistic_id) {
        return Err(invalid("invalid statistic_id"));
    }
    match metadata.statistic_id.split_once(':') {
        None if metadata.source != RECORDER_SOURCE => {
            return Err(invalid("entity statistics must use source 'recorder'"))
        }
        Some((domain, _)) if domain != metadata.source => {
            return Err(invalid("external statistic_id domain must match the source"))
        }
        _ => {}
    }

    let period = table.period_seconds();
    for row in statistics {
        if row.start.timestamp_subsec_nanos() != 0 || row.start.timestamp().rem_euclid(period) != 0 {
            return Err(invalid(&format!("invalid timestamp {}", row.start)));
        }
    }
    Ok(())
}

/// Insert or update metadata, returning its id
pub fn update_or_add_metadata(conn: &Connection, metadata: &StatisticMetaData) -> RecorderResult<i64> {
    conn.prepare_cached(
        "INSERT INTO statistics_meta (statistic_id, source, unit_of_measurement, has_mean, has_sum, name) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(statistic_id) DO UPDATE SET source = excluded.source, \
         unit_of_measurement = excluded.unit_of_measurement, has_mean = excluded.has_mean, \
         has_sum = excluded.has_sum, name = excluded.name",
    )?
    .execute(params![
        metadata.statistic_id,
        metadata.source,
        metadata.unit_of_measurement,
        metadata.has_mean,
        metadata.has_sum,
        metadata.name,
    ])?;
    Ok(conn
        .prepare_cached("SELECT id FROM statistics_meta WHERE statistic_id = ?1")?
        .query_row([&metadata.statistic_id], |row| row.get(0))?)
}

fn upsert_statistic(
    conn: &Connection,
    table: StatisticsTable,
    metadata_id: i64,
    row: &StatisticData,
) -> RecorderResult<()> {
    let sql = format!(
        "INSERT INTO {table} (created_ts, metadata_id, start_ts, mean, min, max, last_reset_ts, state, sum) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         ON CONFLICT(metadata_id, start_ts) DO UPDATE SET mean = excluded.mean, min = excluded.min, \
         max = excluded.max, last_reset_ts = excluded.last_reset_ts, state = excluded.state, \
         sum = excluded.sum",
        table = table.table_name()
    );
    conn.prepare_cached(&sql)?.execute(params![
        dt_to_ts(Utc::now()),
        metadata_id,
        dt_to_ts(row.start),
        row.mean,
        row.min,
        row.max,
        row.last_reset.map(dt_to_ts),
        row.state,
        row.sum,
    ])?;
    Ok(())
}

/// Write imported statistics, replacing rows with the same start
pub fn import_statistics(
    conn: &Connection,
    metadata: &StatisticMetaData,
    statistics: &[StatisticData],
    table: StatisticsTable,
) -> RecorderResult<()> {
    let tx = conn.unchecked_transaction()?;
    let metadata_id = update_or_add_metadata(&tx, metadata)?;
    for row in statistics {
        upsert_statistic(&tx, table, metadata_id, row)?;
    }
    tx.commit()?;
    debug!(
        statistic_id = %metadata.statistic_id,
        rows = statistics.len(),
        table = table.table_name(),
        "Imported statistics"
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateClass {
    Measurement,
    Total,
    TotalIncreasing,
}

struct Sample {
    ts: f64,
    state: Option<String>,
    attributes: Option<String>,
}

impl Sample {
    fn value(&self) -> Option<f64> {
        self.state
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }
}

fn read_sample(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sample> {
    Ok(Sample {
        state: row.get(0)?,
        ts: row.get(1)?,
        attributes: row.get(2)?,
    })
}

/// The state in effect at `start` followed by every state inside the period
fn samples_for(conn: &Connection, entity_id: &str, start: f64, end: f64) -> RecorderResult<Vec<Sample>> {
    let mut samples = Vec::new();
    let initial = conn
        .prepare_cached(
            "SELECT s.state, s.last_updated_ts, a.shared_attrs FROM states s \
             LEFT JOIN state_attributes a ON s.attributes_id = a.attributes_id \
             WHERE s.entity_id = ?1 AND s.last_updated_ts < ?2 \
             ORDER BY s.last_updated_ts DESC, s.state_id DESC LIMIT 1",
        )?
        .query_row(params![entity_id, start], read_sample)
        .optional()?;
    samples.extend(initial);

    let mut stmt = conn.prepare_cached(
        "SELECT s.state, s.last_updated_ts, a.shared_attrs FROM states s \
         LEFT JOIN state_attributes a ON s.attributes_id = a.attributes_id \
         WHERE s.entity_id = ?1 AND s.last_updated_ts >= ?2 AND s.last_updated_ts < ?3 \
         ORDER BY s.last_updated_ts, s.state_id",
    )?;
    let rows = stmt.query_map(params![entity_id, start, end], read_sample)?;
    for sample in rows {
        samples.push(sample?);
    }
    Ok(samples)
}

fn state_class_and_unit(attributes: &str) -> Option<(StateClass, Option<String>)> {
    let attributes: Value = serde_json::from_str(attributes).ok()?;
    let state_class = match attributes.get(ATTR_STATE_CLASS)?.as_str()? {
        "measurement" => StateClass::Measurement,
        "total" => StateClass::Total,
        "total_increasing" => StateClass::TotalIncreasing,
        _ => return None,
    };
    let unit = attributes
        .get(ATTR_UNIT_OF_MEASUREMENT)
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((state_class, unit))
}

/// Time-weighted mean, min and max over `[start, end)`
fn time_weighted(samples: &[Sample], start: f64, end: f64) -> Option<(f64, f64, f64)> {
    let mut weighted = 0.0;
    let mut duration = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for (i, sample) in samples.iter().enumerate() {
        let Some(value) = sample.value() else {
            continue;
        };
        let from = sample.ts.max(start);
        let until = samples.get(i + 1).map_or(end, |next| next.ts.max(start));
        let span = (until - from).max(0.0);
        weighted += value * span;
        duration += span;
        min = min.min(value);
        max = max.max(value);
    }

    (duration > 0.0).then(|| (weighted / duration, min, max))
}

fn compile_short_term(conn: &Connection, start: DateTime<Utc>, end: DateTime<Utc>) -> RecorderResult<usize> {
    let (start_ts, end_ts) = (dt_to_ts(start), dt_to_ts(end));

    let entity_ids: Vec<String> = {
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT s.entity_id FROM states s \
             JOIN state_attributes a ON s.attributes_id = a.attributes_id \
             WHERE s.last_updated_ts < ?1 AND a.shared_attrs LIKE '%\"state_class\"%'",
        )?;
        let rows = stmt.query_map([end_ts], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut compiled = 0;
    for entity_id in entity_ids {
        let samples = samples_for(conn, &entity_id, start_ts, end_ts)?;
        let Some(latest) = samples.last() else {
            continue;
        };
        // Removed entities have a NULL state
        if latest.state.is_none() {
            continue;
        }
        let Some((state_class, unit)) = latest.attributes.as_deref().and_then(state_class_and_unit)
        else {
            continue;
        };

        let is_measurement = state_class == StateClass::Measurement;
        let metadata = StatisticMetaData {
            statistic_id: entity_id.clone(),
            source: RECORDER_SOURCE.to_string(),
            unit_of_measurement: unit,
            has_mean: is_measurement,
            has_sum: !is_measurement,
            name: None,
        };

        let mut row = StatisticData::empty(start);
        if is_measurement {
            let Some((mean, min, max)) = time_weighted(&samples, start_ts, end_ts) else {
                continue;
            };
            row.mean = Some(mean);
            row.min = Some(min);
            row.max = Some(max);
            let metadata_id = update_or_add_metadata(conn, &metadata)?;
            upsert_statistic(conn, StatisticsTable::ShortTerm, metadata_id, &row)?;
        } else {
            let values: Vec<f64> = samples.iter().filter_map(Sample::value).collect();
            let Some(first) = values.first().copied() else {
                continue;
            };
            let metadata_id = update_or_add_metadata(conn, &metadata)?;
            let previous: Option<(Option<f64>, Option<f64>)> = conn
                .prepare_cached(
                    "SELECT state, sum FROM statistics_short_term \
                     WHERE metadata_id = ?1 AND start_ts < ?2 ORDER BY start_ts DESC LIMIT 1",
                )?
                .query_row(params![metadata_id, start_ts], |r| Ok((r.get(0)?, r.get(1)?)))
                .optional()?;
            let (mut last, mut sum) = match previous {
                Some((state, sum)) => (state.unwrap_or(first), sum.unwrap_or(0.0)),
                None => (first, 0.0),
            };
            for value in values {
                if state_class == StateClass::TotalIncreasing && value < last {
                    trace!(entity_id = %entity_id, from = last, to = value, "Detected meter reset");
                    sum += value;
                } else {
                    sum += value - last;
                }
                last = value;
            }
            row.state = Some(last);
            row.sum = Some(sum);
            upsert_statistic(conn, StatisticsTable::ShortTerm, metadata_id, &row)?;
        }
        compiled += 1;
    }
    Ok(compiled)
}

/// Roll the short-term rows of one hour up into `statistics`
pub fn compile_hourly_statistics(conn: &Connection, hour_start: DateTime<Utc>) -> RecorderResult<()> {
    let start_ts = dt_to_ts(hour_start);
    let end_ts = dt_to_ts(hour_start + Duration::hours(1));
    let mut rows: BTreeMap<i64, StatisticData> = BTreeMap::new();

    {
        let mut stmt = conn.prepare_cached(
            "SELECT metadata_id, AVG(mean), MIN(min), MAX(max) FROM statistics_short_term \
             WHERE start_ts >= ?1 AND start_ts < ?2 AND mean IS NOT NULL GROUP BY metadata_id",
        )?;
        let means = stmt.query_map(params![start_ts, end_ts], |r| {
            Ok((r.get::<_, i64>(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?;
        for mean in means {
            let (metadata_id, mean, min, max) = mean?;
            let row = rows
                .entry(metadata_id)
                .or_insert_with(|| StatisticData::empty(hour_start));
            row.mean = mean;
            row.min = min;
            row.max = max;
        }
    }

    {
        let mut stmt = conn.prepare_cached(
            "SELECT s.metadata_id, s.last_reset_ts, s.state, s.sum FROM statistics_short_term s \
             JOIN (SELECT metadata_id, MAX(start_ts) AS max_start FROM statistics_short_term \
                   WHERE start_ts >= ?1 AND start_ts < ?2 AND sum IS NOT NULL GROUP BY metadata_id) latest \
             ON s.metadata_id = latest.metadata_id AND s.start_ts = latest.max_start",
        )?;
        let sums = stmt.query_map(params![start_ts, end_ts], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, Option<f64>>(1)?,
                r.get(2)?,
                r.get(3)?,
            ))
        })?;
        for sum in sums {
            let (metadata_id, last_reset, state, sum) = sum?;
            let row = rows
                .entry(metadata_id)
                .or_insert_with(|| StatisticData::empty(hour_start));
            row.last_reset = last_reset.map(ts_to_dt);
            row.state = state;
            row.sum = sum;
        }
    }

    for (metadata_id, row) in &rows {
        upsert_statistic(conn, StatisticsTable::Hourly, *metadata_id, row)?;
    }
    debug!(hour = %hour_start, statistics = rows.len(), "Compiled hourly statistics");
    Ok(())
}

/// Compile the five-minute period starting at `start`.
///
/// Returns false when the period had already been compiled.
pub fn compile_statistics(conn: &Connection, start: DateTime<Utc>) -> RecorderResult<bool> {
    let start_ts = dt_to_ts(start);
    let done = conn
        .prepare_cached("SELECT 1 FROM statistics_runs WHERE start = ?1")?
        .query_row([start_ts], |_| Ok(()))
        .optional()?;
    if done.is_some() {
        debug!(start = %start, "Statistics already compiled");
        return Ok(false);
    }

    let end = start + Duration::seconds(PERIOD_SECONDS);
    let tx = conn.unchecked_transaction()?;
    let compiled = compile_short_term(&tx, start, end)?;
    if start.minute() == 55 {
        compile_hourly_statistics(&tx, start - Duration::minutes(55))?;
    }
    tx.execute("INSERT INTO statistics_runs (start) VALUES (?1)", [start_ts])?;
    tx.commit()?;
    debug!(start = %start, statistics = compiled, "Compiled short-term statistics");
    Ok(true)
}

/// Compile periods missed since the last run, at most `max_periods` per call.
///
/// Returns true once caught up.
pub fn compile_missing_statistics(
    conn: &Connection,
    now: DateTime<Utc>,
    keep_days: u32,
    max_periods: usize,
) -> RecorderResult<bool> {
    let current_period = floor_to(now, PERIOD_SECONDS);
    let mut start = floor_to(now - Duration::days(i64::from(keep_days)), 3600);
    let last_run: Option<f64> =
        conn.query_row("SELECT MAX(start) FROM statistics_runs", [], |row| row.get(0))?;
    if let Some(last_run) = last_run {
        start = start.max(ts_to_dt(last_run) + Duration::seconds(PERIOD_SECONDS));
    }

    let mut compiled = 0;
    while start < current_period {
        if compiled >= max_periods {
            return Ok(false);
        }
        compile_statistics(conn, start)?;
        start += Duration::seconds(PERIOD_SECONDS);
        compiled += 1;
    }
    Ok(true)
}
