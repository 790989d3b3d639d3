//! Home Assistant Recorder
//!
//! Loads the `recorder:` section of `configuration.yaml`, starts the
//! recorder and feeds it newline-delimited JSON from stdin. Each line is
//! either an event:
//!
//! ```text
//! {"event_type": "state_changed", "data": {"entity_id": "sensor.x", "new_state": {...}}}
//! ```
//!
//! or a recorder service call:
//!
//! ```text
//! {"service": "purge", "data": {"keep_days": 3}}
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ha_core::events::HOMEASSISTANT_STOP;
use ha_core::Event;
use ha_recorder::{Recorder, RecorderConfig};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about = "Records Home Assistant events into SQLite")]
struct Cli {
    /// Configuration directory containing configuration.yaml
    #[arg(short, long, default_value = ".")]
    config: PathBuf,
}

/// One line of input
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Input {
    Service {
        service: String,
        #[serde(default)]
        data: Value,
    },
    Event(Event),
}

/// Feed one input line to the recorder; false once Home Assistant stopped
fn handle_line(recorder: &Recorder, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    match serde_json::from_str::<Input>(line) {
        Ok(Input::Service { service, data }) => {
            if let Err(err) = recorder.call_service(&service, &data) {
                warn!(service = %service, error = %err, "Service call failed");
            }
        }
        Ok(Input::Event(event)) => {
            let event_type = event.event_type.clone();
            if !recorder.record_event(event) {
                debug!(event_type = %event_type, "Event not recorded");
            }
            if event_type == *HOMEASSISTANT_STOP {
                return false;
            }
        }
        Err(err) => warn!(error = %err, "Ignoring malformed input line"),
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(config_dir = %cli.config.display(), "Starting Home Assistant recorder");

    let config = RecorderConfig::load(&cli.config).context("failed to load recorder configuration")?;
    let recorder = Recorder::start(config).await?;
    if !recorder.async_db_ready().await {
        bail!("recorder database setup failed");
    }

    info!("Recorder is running");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&recorder, &line) {
                        info!("Home Assistant stopped");
                        break;
                    }
                }
                None => {
                    info!("Input closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    recorder.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_line() {
        let input: Input = serde_json::from_str(r#"{"service": "purge", "data": {"keep_days": 3}}"#).unwrap();
        assert!(matches!(input, Input::Service { ref service, .. } if service == "purge"));
    }

    #[test]
    fn test_parse_event_line() {
        let input: Input = serde_json::from_str(
            r#"{"event_type": "state_changed", "data": {"entity_id": "sensor.x", "new_state": null}}"#,
        )
        .unwrap();
        match input {
            Input::Event(event) => assert_eq!(event.event_type.as_str(), "state_changed"),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["homeassistant-recorder"]);
        assert_eq!(cli.config, PathBuf::from("."));
    }
}
