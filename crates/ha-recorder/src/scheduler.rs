//! Timers that feed the writer queue
//!
//! - commit every `commit_interval` (skipped when it is zero)
//! - keepalive for socket dialects
//! - nightly purge or cleanup at 04:12 local time
//! - short-term statistics five minutes apart, ten seconds into the period
//! - queue watcher that stops intake when the backlog overflows

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, NaiveTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error};

use crate::recorder::RecorderShared;
use crate::statistics::{get_start_time, PERIOD_SECONDS};
use crate::tasks::{PurgeTask, Task};
use crate::util::is_second_sunday;

const NIGHTLY_HOUR: u32 = 4;
const NIGHTLY_MINUTE: u32 = 12;
const STATISTICS_OFFSET_SECONDS: i64 = 10;

/// Handles of the timer tasks; dropping them does not stop the timers
pub(crate) struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn start(shared: Arc<RecorderShared>) -> Self {
        let config = &shared.config;
        let mut handles = Vec::new();

        if !config.commit_interval.is_zero() {
            handles.push(spawn_every(shared.clone(), config.commit_interval, || Task::Commit));
        }
        if !config.dialect().is_file_based() {
            handles.push(spawn_every(shared.clone(), config.tunables.keepalive_interval, || {
                Task::KeepAlive
            }));
        }
        if config.tunables.periodic_tasks {
            handles.push(tokio::spawn(nightly(shared.clone())));
            handles.push(tokio::spawn(five_minutely(shared.clone())));
        }
        handles.push(tokio::spawn(watch_queue(shared)));

        debug!(timers = handles.len(), "Scheduler started");
        Self { handles }
    }

    pub(crate) fn stop(self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn spawn_every(
    shared: Arc<RecorderShared>,
    period: StdDuration,
    task: impl Fn() -> Task + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !shared.queue.send(task()) {
                break;
            }
        }
    })
}

/// Time until the next `hour:minute` local wall clock time
fn until_next_local(now: DateTime<Local>, hour: u32, minute: u32) -> StdDuration {
    let now = now.naive_local();
    let Some(at) = NaiveTime::from_hms_opt(hour, minute, 0) else {
        return StdDuration::from_secs(24 * 3600);
    };
    let mut next = now.date().and_time(at);
    if next <= now {
        next += Duration::days(1);
    }
    (next - now).to_std().unwrap_or(StdDuration::from_secs(1))
}

/// Time until ten seconds into the next five-minute period
fn until_next_statistics(now: DateTime<Utc>) -> StdDuration {
    let next = get_start_time(now) + Duration::seconds(2 * PERIOD_SECONDS + STATISTICS_OFFSET_SECONDS);
    (next - now).to_std().unwrap_or(StdDuration::from_secs(1))
}

/// The nightly task for `now`
fn nightly_task(shared: &RecorderShared, now: DateTime<Local>) -> Task {
    let config = &shared.config;
    if !config.auto_purge {
        return Task::PeriodicCleanup;
    }
    Task::Purge(PurgeTask {
        purge_before: Utc::now() - Duration::days(i64::from(config.keep_days)),
        repack: config.auto_repack && is_second_sunday(&now),
        apply_filter: false,
    })
}

async fn nightly(shared: Arc<RecorderShared>) {
    loop {
        sleep(until_next_local(Local::now(), NIGHTLY_HOUR, NIGHTLY_MINUTE)).await;
        let task = nightly_task(&shared, Local::now());
        debug!(task = task.name(), "Running nightly task");
        if !shared.queue.send(task) {
            break;
        }
    }
}

async fn five_minutely(shared: Arc<RecorderShared>) {
    loop {
        sleep(until_next_statistics(Utc::now())).await;
        let start = get_start_time(Utc::now());
        if !shared.queue.send(Task::Statistics { start }) {
            break;
        }
    }
}

async fn watch_queue(shared: Arc<RecorderShared>) {
    let max_backlog = shared.config.tunables.max_backlog;
    let mut ticker = interval(shared.config.tunables.queue_watch_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let backlog = shared.queue.backlog();
        // A locked database is allowed to build up a backlog
        if backlog <= max_backlog || shared.is_locked() {
            continue;
        }
        error!(
            backlog,
            max_backlog,
            "The recorder backlog queue reached the maximum size; events are no longer recorded"
        );
        shared.accepting.store(false, Ordering::SeqCst);
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_until_next_local() {
        let before = Local.with_ymd_and_hms(2024, 6, 3, 3, 12, 0).unwrap();
        assert_eq!(until_next_local(before, 4, 12), StdDuration::from_secs(3600));

        let after = Local.with_ymd_and_hms(2024, 6, 3, 5, 12, 0).unwrap();
        assert_eq!(until_next_local(after, 4, 12), StdDuration::from_secs(23 * 3600));
    }

    #[test]
    fn test_until_next_statistics() {
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 10, 7, 0).unwrap();
        // Next run at 10:10:10
        assert_eq!(until_next_statistics(now), StdDuration::from_secs(190));
    }
}
