//! Statistics compilation and import through the writer queue

mod common;

use chrono::{DateTime, Duration, Utc};
use common::*;
use ha_recorder::{RecorderError, StatisticData, StatisticMetaData, StatisticsTable, Task};
use serde_json::json;

#[derive(Debug, PartialEq)]
struct Row {
    mean: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    state: Option<f64>,
    sum: Option<f64>,
}

async fn statistic(t: &TestRecorder, table: &'static str, statistic_id: &str, start: DateTime<Utc>) -> Option<Row> {
    let statistic_id = statistic_id.to_string();
    let start = ha_recorder::util::dt_to_ts(start);
    t.recorder
        .async_add_executor_job(move |conn| {
            let sql = format!(
                "SELECT s.mean, s.min, s.max, s.state, s.sum FROM {table} s \
                 JOIN statistics_meta m ON s.metadata_id = m.id \
                 WHERE m.statistic_id = ?1 AND s.start_ts = ?2"
            );
            let row = conn.query_row(&sql, rusqlite::params![statistic_id, start], |row| {
                Ok(Row {
                    mean: row.get(0)?,
                    min: row.get(1)?,
                    max: row.get(2)?,
                    state: row.get(3)?,
                    sum: row.get(4)?,
                })
            });
            match row {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
        .await
        .unwrap()
}

fn record_sensor_history(t: &TestRecorder) {
    let start = base_time();
    let temperature = json!({"state_class": "measurement", "unit_of_measurement": "°C"});
    record_states(
        &t.recorder,
        &[
            state("sensor.temperature", "10", temperature.clone(), start - Duration::minutes(1)),
            state("sensor.temperature", "20", temperature, start + Duration::seconds(150)),
        ],
    );

    let energy = json!({"state_class": "total_increasing", "unit_of_measurement": "kWh"});
    record_states(
        &t.recorder,
        &[
            state("sensor.energy", "100", energy.clone(), start + Duration::minutes(1)),
            state("sensor.energy", "105", energy.clone(), start + Duration::minutes(2)),
            // Meter reset
            state("sensor.energy", "3", energy.clone(), start + Duration::minutes(3)),
            state("sensor.energy", "8", energy, start + Duration::minutes(4)),
        ],
    );

    record_states(
        &t.recorder,
        &[state("sensor.no_class", "5", json!({}), start + Duration::minutes(1))],
    );
}

#[tokio::test]
async fn test_compile_short_term_statistics() {
    let t = async_test_recorder().await;
    record_sensor_history(&t);
    assert!(t.recorder.queue_task(Task::Statistics { start: base_time() }));
    t.sync().await;

    let temperature = statistic(&t, "statistics_short_term", "sensor.temperature", base_time())
        .await
        .unwrap();
    assert_eq!(temperature.mean, Some(15.0));
    assert_eq!(temperature.min, Some(10.0));
    assert_eq!(temperature.max, Some(20.0));

    let energy = statistic(&t, "statistics_short_term", "sensor.energy", base_time())
        .await
        .unwrap();
    assert_eq!(energy.state, Some(8.0));
    assert_eq!(energy.sum, Some(13.0));

    assert!(statistic(&t, "statistics_short_term", "sensor.no_class", base_time())
        .await
        .is_none());
}

#[tokio::test]
async fn test_period_is_compiled_once() {
    let t = async_test_recorder().await;
    record_sensor_history(&t);
    assert!(t.recorder.queue_task(Task::Statistics { start: base_time() }));
    assert!(t.recorder.queue_task(Task::Statistics { start: base_time() }));
    t.sync().await;

    assert_eq!(t.count("statistics_short_term").await, 2);
}

#[tokio::test]
async fn test_hourly_statistics_at_minute_55() {
    let t = async_test_recorder().await;
    record_sensor_history(&t);
    let last_period = base_time() + Duration::minutes(55);
    assert!(t.recorder.queue_task(Task::Statistics { start: base_time() }));
    assert!(t.recorder.queue_task(Task::Statistics { start: last_period }));
    t.sync().await;

    let temperature = statistic(&t, "statistics", "sensor.temperature", base_time())
        .await
        .unwrap();
    assert_eq!(temperature.mean, Some(17.5));
    assert_eq!(temperature.min, Some(10.0));
    assert_eq!(temperature.max, Some(20.0));

    let energy = statistic(&t, "statistics", "sensor.energy", base_time()).await.unwrap();
    assert_eq!(energy.state, Some(8.0));
    assert_eq!(energy.sum, Some(13.0));
}

#[tokio::test]
async fn test_import_statistics() {
    let t = async_test_recorder().await;
    let metadata = StatisticMetaData {
        statistic_id: "grid:imported".to_string(),
        source: "grid".to_string(),
        unit_of_measurement: Some("kWh".to_string()),
        has_mean: false,
        has_sum: true,
        name: Some("Imported energy".to_string()),
    };
    let row = |hours: i64, sum: f64| StatisticData {
        start: base_time() + Duration::hours(hours),
        mean: None,
        min: None,
        max: None,
        last_reset: None,
        state: Some(sum),
        sum: Some(sum),
    };

    t.recorder
        .import_statistics(metadata.clone(), vec![row(0, 1.0), row(1, 2.0)], StatisticsTable::Hourly)
        .unwrap();
    // Same start again replaces the row
    t.recorder
        .import_statistics(metadata.clone(), vec![row(1, 5.0)], StatisticsTable::Hourly)
        .unwrap();
    t.sync().await;

    assert_eq!(t.count("statistics").await, 2);
    let updated = statistic(&t, "statistics", "grid:imported", base_time() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(updated.sum, Some(5.0));

    let mut wrong_source = metadata;
    wrong_source.source = "solar".to_string();
    assert!(matches!(
        t.recorder
            .import_statistics(wrong_source, vec![row(2, 1.0)], StatisticsTable::Hourly),
        Err(RecorderError::InvalidStatistic { .. })
    ));
}
