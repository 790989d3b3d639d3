//! Recorder configuration
//!
//! The `recorder:` section of `configuration.yaml`:
//!
//! ```yaml
//! recorder:
//!   db_url: sqlite:////config/home-assistant_v2.db
//!   commit_interval: 5
//!   keep_days: 10
//!   auto_purge: true
//!   auto_repack: true
//!   exclude:
//!     domains: [automation]
//!     entity_globs: ["sensor.weather_*"]
//!     event_types: [call_service]
//!   include:
//!     entities: [sensor.outside_temperature]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

use crate::error::{ConfigError, ConfigResult};

/// Default database file name inside the config directory
pub const DEFAULT_DB_FILE: &str = "home-assistant_v2.db";

/// Name of the main configuration file
pub const CONFIG_FILE: &str = "configuration.yaml";

pub const DEFAULT_COMMIT_INTERVAL: u64 = 5;
pub const DEFAULT_KEEP_DAYS: u32 = 10;
pub const DEFAULT_DB_MAX_RETRIES: u32 = 10;
pub const DEFAULT_DB_RETRY_WAIT: u64 = 3;

/// Largest number of bound parameters used in one statement
pub const SQLITE_MAX_BIND_VARS: usize = 998;

/// Database backend named by the URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
    PostgreSql,
}

impl Dialect {
    /// File-based engines need no keepalive
    pub fn is_file_based(self) -> bool {
        matches!(self, Dialect::Sqlite)
    }

    pub fn name(self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::MySql => "mysql",
            Dialect::PostgreSql => "postgresql",
        }
    }
}

/// A parsed `db_url`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUrl {
    pub url: String,
    pub dialect: Dialect,
    /// Database file, for file-based dialects
    pub path: Option<PathBuf>,
}

impl DatabaseUrl {
    /// Parse an SQLAlchemy-style URL (`sqlite:////abs/path.db`, `mysql://...`).
    ///
    /// In-memory SQLite URLs are rejected.
    pub fn parse(url: &str) -> ConfigResult<Self> {
        let (scheme, rest) = url.split_once("://").ok_or_else(|| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: "missing '://' separator".to_string(),
        })?;
        // mysql+pymysql://, postgresql+psycopg2://
        let dialect_name = scheme.split('+').next().unwrap_or(scheme);
        let dialect = match dialect_name {
            "sqlite" => Dialect::Sqlite,
            "mysql" | "mariadb" => Dialect::MySql,
            "postgresql" | "postgres" => Dialect::PostgreSql,
            other => {
                return Err(ConfigError::UnsupportedDialect {
                    dialect: other.to_string(),
                })
            }
        };

        if dialect != Dialect::Sqlite {
            return Ok(Self {
                url: url.to_string(),
                dialect,
                path: None,
            });
        }

        let in_memory = || ConfigError::InMemoryDatabase {
            url: url.to_string(),
        };
        let Some(path) = rest.strip_prefix('/') else {
            return if rest.is_empty() {
                Err(in_memory())
            } else {
                Err(ConfigError::InvalidUrl {
                    url: url.to_string(),
                    reason: "sqlite URLs must have the form sqlite:///<path>".to_string(),
                })
            };
        };
        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        if path.is_empty() || path == ":memory:" || query.contains("mode=memory") {
            return Err(in_memory());
        }

        Ok(Self {
            url: url.to_string(),
            dialect,
            path: Some(PathBuf::from(path)),
        })
    }
}

/// Entity / event filter lists as written in YAML
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default, deserialize_with = "string_or_list")]
    pub domains: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub entities: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub entity_globs: Vec<String>,
    /// Only meaningful under `exclude`
    #[serde(default, deserialize_with = "string_or_list")]
    pub event_types: Vec<String>,
}

impl FilterConfig {
    pub fn has_entity_filters(&self) -> bool {
        !(self.domains.is_empty() && self.entities.is_empty() && self.entity_globs.is_empty())
    }
}

pub(crate) fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

/// Raw YAML shape of the `recorder:` section
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecorderSection {
    #[serde(default)]
    db_url: Option<String>,
    #[serde(default = "default_commit_interval")]
    commit_interval: u64,
    #[serde(default = "default_keep_days", alias = "purge_keep_days")]
    keep_days: u32,
    #[serde(default = "default_true")]
    auto_purge: bool,
    #[serde(default = "default_true")]
    auto_repack: bool,
    #[serde(default = "default_db_max_retries")]
    db_max_retries: u32,
    #[serde(default = "default_db_retry_wait")]
    db_retry_wait: u64,
    #[serde(default)]
    exclude: FilterConfig,
    #[serde(default)]
    include: FilterConfig,
}

fn default_commit_interval() -> u64 {
    DEFAULT_COMMIT_INTERVAL
}

fn default_keep_days() -> u32 {
    DEFAULT_KEEP_DAYS
}

fn default_true() -> bool {
    true
}

fn default_db_max_retries() -> u32 {
    DEFAULT_DB_MAX_RETRIES
}

fn default_db_retry_wait() -> u64 {
    DEFAULT_DB_RETRY_WAIT
}

/// Engine knobs that are not user configuration
#[derive(Debug, Clone)]
pub struct RecorderTunables {
    /// Rows selected per table in one purge batch
    pub purge_batch_size: usize,
    /// Batches run by a single purge task before it yields to the queue
    pub purge_batches_per_task: usize,
    /// Five-minute periods compiled by one catch-up task
    pub statistics_periods_per_task: usize,
    /// Entries per dedup LRU cache
    pub cache_size: usize,
    /// Commits between prepared statement cache flushes
    pub expire_after_commits: usize,
    /// Queue length that triggers overflow handling
    pub max_backlog: usize,
    /// How long `lock_database` waits for the writer
    pub lock_timeout: Duration,
    /// How often a locked writer re-checks its backlog
    pub lock_check_interval: Duration,
    pub keepalive_interval: Duration,
    pub queue_watch_interval: Duration,
    /// Schedule nightly purge and five-minute statistics
    pub periodic_tasks: bool,
}

impl Default for RecorderTunables {
    fn default() -> Self {
        Self {
            purge_batch_size: SQLITE_MAX_BIND_VARS,
            purge_batches_per_task: 10,
            statistics_periods_per_task: 12,
            cache_size: 2048,
            expire_after_commits: 120,
            max_backlog: 65_000,
            lock_timeout: Duration::from_secs(30),
            lock_check_interval: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            queue_watch_interval: Duration::from_secs(5 * 60),
            periodic_tasks: true,
        }
    }
}

/// Validated recorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub db_url: DatabaseUrl,
    /// Zero commits after every task
    pub commit_interval: Duration,
    pub keep_days: u32,
    pub auto_purge: bool,
    pub auto_repack: bool,
    pub db_max_retries: u32,
    pub db_retry_wait: Duration,
    pub exclude: FilterConfig,
    pub include: FilterConfig,
    pub tunables: RecorderTunables,
}

impl RecorderConfig {
    /// Defaults with the database stored in `config_dir`
    pub fn new(config_dir: &Path) -> ConfigResult<Self> {
        Self::from_yaml(&Value::Mapping(serde_yaml::Mapping::new()), config_dir)
    }

    /// Configuration for an explicit SQLite file
    pub fn with_sqlite_file(path: &Path) -> ConfigResult<Self> {
        let mut config = Self::new(path.parent().unwrap_or_else(|| Path::new(".")))?;
        config.db_url = DatabaseUrl::parse(&format!("sqlite:///{}", path.display()))?;
        Ok(config)
    }

    /// Build from a parsed `configuration.yaml` document
    pub fn from_yaml(yaml: &Value, config_dir: &Path) -> ConfigResult<Self> {
        let mapping = yaml.as_mapping().ok_or_else(|| ConfigError::InvalidValue {
            key: "root".to_string(),
            reason: "configuration must be a mapping".to_string(),
        })?;

        // `recorder:` with no body is valid and means "all defaults"
        let section = match mapping.get(&Value::String("recorder".to_string())) {
            None | Some(Value::Null) => Value::Mapping(serde_yaml::Mapping::new()),
            Some(value) => value.clone(),
        };

        let raw: RecorderSection =
            serde_yaml::from_value(section).map_err(|e| ConfigError::InvalidValue {
                key: "recorder".to_string(),
                reason: e.to_string(),
            })?;

        if raw.keep_days < 1 {
            return Err(ConfigError::InvalidValue {
                key: "recorder.keep_days".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !raw.include.event_types.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "recorder.include.event_types".to_string(),
                reason: "event types can only be excluded".to_string(),
            });
        }

        let db_url = match raw.db_url {
            Some(url) => url,
            None => format!("sqlite:///{}", config_dir.join(DEFAULT_DB_FILE).display()),
        };

        Ok(Self {
            db_url: DatabaseUrl::parse(&db_url)?,
            commit_interval: Duration::from_secs(raw.commit_interval),
            keep_days: raw.keep_days,
            auto_purge: raw.auto_purge,
            auto_repack: raw.auto_repack,
            db_max_retries: raw.db_max_retries,
            db_retry_wait: Duration::from_secs(raw.db_retry_wait),
            exclude: raw.exclude,
            include: raw.include,
            tunables: RecorderTunables::default(),
        })
    }

    /// Load `configuration.yaml` from `config_dir`; a missing file means defaults
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Self::new(config_dir);
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;
        let yaml: Value = serde_yaml::from_str(&content)
            .map_err(|source| ConfigError::ParseYaml { path, source })?;
        // An empty file parses as null
        let yaml = match yaml {
            Value::Null => Value::Mapping(serde_yaml::Mapping::new()),
            other => other,
        };
        Self::from_yaml(&yaml, config_dir)
    }

    pub fn dialect(&self) -> Dialect {
        self.db_url.dialect
    }

    /// Database file for SQLite
    pub fn db_path(&self) -> Option<&Path> {
        self.db_url.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ConfigResult<RecorderConfig> {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        RecorderConfig::from_yaml(&value, Path::new("/config"))
    }

    #[test]
    fn test_defaults() {
        let config = parse("recorder:\n").unwrap();
        assert_eq!(config.db_url.dialect, Dialect::Sqlite);
        assert_eq!(
            config.db_path(),
            Some(Path::new("/config/home-assistant_v2.db"))
        );
        assert_eq!(config.commit_interval, Duration::from_secs(5));
        assert_eq!(config.keep_days, 10);
        assert!(config.auto_purge);
        assert!(config.auto_repack);
        assert_eq!(config.db_max_retries, 10);
        assert_eq!(config.db_retry_wait, Duration::from_secs(3));
    }

    #[test]
    fn test_full_section() {
        let config = parse(
            r#"
recorder:
  db_url: "sqlite:////tmp/test.db"
  commit_interval: 0
  purge_keep_days: 3
  auto_repack: false
  exclude:
    domains: automation
    entity_globs: ["sensor.weather_*"]
    event_types: [call_service]
  include:
    entities:
      - sensor.outside
"#,
        )
        .unwrap();
        assert_eq!(config.db_path(), Some(Path::new("/tmp/test.db")));
        assert!(config.commit_interval.is_zero());
        assert_eq!(config.keep_days, 3);
        assert!(!config.auto_repack);
        assert_eq!(config.exclude.domains, vec!["automation"]);
        assert_eq!(config.exclude.event_types, vec!["call_service"]);
        assert_eq!(config.include.entities, vec!["sensor.outside"]);
    }

    #[test]
    fn test_rejects_in_memory_urls() {
        for url in ["sqlite://", "sqlite:///:memory:", "sqlite:///file.db?mode=memory"] {
            let err = DatabaseUrl::parse(url).unwrap_err();
            assert!(matches!(err, ConfigError::InMemoryDatabase { .. }), "{url}");
        }
    }

    #[test]
    fn test_dialects() {
        let mysql = DatabaseUrl::parse("mysql+pymysql://user:pw@host/ha").unwrap();
        assert_eq!(mysql.dialect, Dialect::MySql);
        assert!(!mysql.dialect.is_file_based());
        let pg = DatabaseUrl::parse("postgresql://host/ha").unwrap();
        assert_eq!(pg.dialect, Dialect::PostgreSql);
        assert!(matches!(
            DatabaseUrl::parse("oracle://host/db"),
            Err(ConfigError::UnsupportedDialect { .. })
        ));
        assert!(matches!(
            DatabaseUrl::parse("not a url"),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse("recorder:\n  keep_days: 0\n").is_err());
        assert!(parse("recorder:\n  unknown_option: 1\n").is_err());
        assert!(parse("recorder:\n  include:\n    event_types: [foo]\n").is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecorderConfig::load(dir.path()).unwrap();
        assert_eq!(
            config.db_path(),
            Some(dir.path().join(DEFAULT_DB_FILE).as_path())
        );
    }

    #[test]
    fn test_load_reads_configuration_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "homeassistant:\n  name: Home\nrecorder:\n  keep_days: 7\n",
        )
        .unwrap();
        let config = RecorderConfig::load(dir.path()).unwrap();
        assert_eq!(config.keep_days, 7);
    }
}
