//! Table layout of the recorder database
//!
//! Timestamps are stored as REAL seconds since the epoch (`*_ts` columns).
//! `event_data` and `state_attributes` are content-addressed: `hash` is the
//! XXH3-64 hash of the canonical JSON payload and is only an index, equality
//! of the payload itself decides whether two rows are the same.

/// Current schema version
pub const SCHEMA_VERSION: i64 = 3;

pub const TABLE_EVENTS: &str = "events";
pub const TABLE_EVENT_DATA: &str = "event_data";
pub const TABLE_STATES: &str = "states";
pub const TABLE_STATE_ATTRIBUTES: &str = "state_attributes";
pub const TABLE_RECORDER_RUNS: &str = "recorder_runs";
pub const TABLE_SCHEMA_CHANGES: &str = "schema_changes";
pub const TABLE_STATISTICS: &str = "statistics";
pub const TABLE_STATISTICS_SHORT_TERM: &str = "statistics_short_term";
pub const TABLE_STATISTICS_META: &str = "statistics_meta";
pub const TABLE_STATISTICS_RUNS: &str = "statistics_runs";

pub const ALL_TABLES: &[&str] = &[
    TABLE_EVENT_DATA,
    TABLE_EVENTS,
    TABLE_STATE_ATTRIBUTES,
    TABLE_STATES,
    TABLE_RECORDER_RUNS,
    TABLE_SCHEMA_CHANGES,
    TABLE_STATISTICS_META,
    TABLE_STATISTICS,
    TABLE_STATISTICS_SHORT_TERM,
    TABLE_STATISTICS_RUNS,
];

/// Index that marks a database still linking states to events by event_id
pub const LEGACY_STATES_EVENT_ID_INDEX: &str = "ix_states_event_id";

/// Payloads larger than this are stored as `{}`
pub const MAX_STATE_ATTRS_BYTES: usize = 16384;
pub const MAX_EVENT_DATA_BYTES: usize = 32768;

/// Tables written since schema version 1
pub(crate) const CORE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS event_data (
    data_id INTEGER PRIMARY KEY,
    hash INTEGER,
    shared_data TEXT
);
CREATE INDEX IF NOT EXISTS ix_event_data_hash ON event_data(hash);

CREATE TABLE IF NOT EXISTS events (
    event_id INTEGER PRIMARY KEY,
    event_type TEXT,
    origin_idx INTEGER,
    time_fired_ts REAL,
    context_id TEXT,
    context_user_id TEXT,
    context_parent_id TEXT,
    data_id INTEGER REFERENCES event_data(data_id)
);
CREATE INDEX IF NOT EXISTS ix_events_time_fired_ts ON events(time_fired_ts);
CREATE INDEX IF NOT EXISTS ix_events_event_type_time_fired_ts ON events(event_type, time_fired_ts);

CREATE TABLE IF NOT EXISTS state_attributes (
    attributes_id INTEGER PRIMARY KEY,
    hash INTEGER,
    shared_attrs TEXT
);
CREATE INDEX IF NOT EXISTS ix_state_attributes_hash ON state_attributes(hash);

CREATE TABLE IF NOT EXISTS states (
    state_id INTEGER PRIMARY KEY,
    entity_id TEXT,
    state TEXT,
    attributes_id INTEGER REFERENCES state_attributes(attributes_id),
    event_id INTEGER REFERENCES events(event_id),
    last_changed_ts REAL,
    last_updated_ts REAL,
    last_reported_ts REAL,
    old_state_id INTEGER REFERENCES states(state_id),
    origin_idx INTEGER,
    context_id TEXT,
    context_user_id TEXT,
    context_parent_id TEXT
);
CREATE INDEX IF NOT EXISTS ix_states_entity_id_last_updated_ts ON states(entity_id, last_updated_ts);
CREATE INDEX IF NOT EXISTS ix_states_last_updated_ts ON states(last_updated_ts);

CREATE TABLE IF NOT EXISTS recorder_runs (
    run_id INTEGER PRIMARY KEY,
    start REAL NOT NULL,
    "end" REAL,
    closed_incorrect INTEGER NOT NULL DEFAULT 0,
    created REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_recorder_runs_start_end ON recorder_runs(start, "end");

CREATE TABLE IF NOT EXISTS schema_changes (
    change_id INTEGER PRIMARY KEY,
    schema_version INTEGER,
    changed REAL NOT NULL
);
"#;

/// Statistics tables (schema version 2)
pub(crate) const STATISTICS_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS statistics_meta (
    id INTEGER PRIMARY KEY,
    statistic_id TEXT NOT NULL UNIQUE,
    source TEXT NOT NULL,
    unit_of_measurement TEXT,
    has_mean INTEGER NOT NULL DEFAULT 0,
    has_sum INTEGER NOT NULL DEFAULT 0,
    name TEXT
);

CREATE TABLE IF NOT EXISTS statistics (
    id INTEGER PRIMARY KEY,
    created_ts REAL NOT NULL,
    metadata_id INTEGER NOT NULL REFERENCES statistics_meta(id) ON DELETE CASCADE,
    start_ts REAL NOT NULL,
    mean REAL,
    min REAL,
    max REAL,
    last_reset_ts REAL,
    state REAL,
    sum REAL
);
CREATE UNIQUE INDEX IF NOT EXISTS ix_statistics_statistic_id_start_ts ON statistics(metadata_id, start_ts);
CREATE INDEX IF NOT EXISTS ix_statistics_start_ts ON statistics(start_ts);

CREATE TABLE IF NOT EXISTS statistics_short_term (
    id INTEGER PRIMARY KEY,
    created_ts REAL NOT NULL,
    metadata_id INTEGER NOT NULL REFERENCES statistics_meta(id) ON DELETE CASCADE,
    start_ts REAL NOT NULL,
    mean REAL,
    min REAL,
    max REAL,
    last_reset_ts REAL,
    state REAL,
    sum REAL
);
CREATE UNIQUE INDEX IF NOT EXISTS ix_statistics_short_term_statistic_id_start_ts ON statistics_short_term(metadata_id, start_ts);
CREATE INDEX IF NOT EXISTS ix_statistics_short_term_start_ts ON statistics_short_term(start_ts);

CREATE TABLE IF NOT EXISTS statistics_runs (
    run_id INTEGER PRIMARY KEY,
    start REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_statistics_runs_start ON statistics_runs(start);
"#;

/// Indexes that keep purge selections and blob reference checks cheap
/// (schema version 3)
pub(crate) const PURGE_INDEXES_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS ix_states_old_state_id ON states(old_state_id);
CREATE INDEX IF NOT EXISTS ix_states_attributes_id ON states(attributes_id);
CREATE INDEX IF NOT EXISTS ix_events_data_id ON events(data_id);
"#;
