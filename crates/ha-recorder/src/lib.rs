//! Recorder for Home Assistant
//!
//! Persists state changes and events into SQLite through a single writer
//! thread:
//!
//! - identical event data and state attributes are stored once
//! - short-term and hourly statistics are compiled from numeric states
//! - old rows are purged in bounded batches without blocking producers
//! - the database can be locked for an external backup
//! - a corrupt database file is moved aside and replaced
//!
//! # Example
//!
//! ```ignore
//! use ha_recorder::{Recorder, RecorderConfig};
//!
//! let config = RecorderConfig::load(Path::new("/config"))?;
//! let recorder = Recorder::start(config).await?;
//! recorder.async_db_ready().await;
//! recorder.record_event(event);
//! recorder.shutdown().await?;
//! ```

pub mod config;
pub mod dedup;
mod error;
pub mod filters;
pub mod migration;
pub mod pool;
pub mod purge;
mod recorder;
pub mod recovery;
pub mod runs;
mod scheduler;
pub mod schema;
pub mod services;
pub mod states_manager;
pub mod statistics;
pub mod tasks;
pub mod util;
mod writer;

pub use config::{DatabaseUrl, Dialect, FilterConfig, RecorderConfig, RecorderTunables};
pub use error::{
    ConfigError, ConfigResult, RecorderError, RecorderResult, ServiceError, ServiceResult,
};
pub use filters::{EntityFilter, EventFilter};
pub use recorder::Recorder;
pub use recovery::DatabaseHealth;
pub use statistics::{StatisticData, StatisticMetaData, StatisticsTable};
pub use tasks::{PurgeEntitiesTask, PurgeTask, Task};
