//! Periodic job production

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::{Job, TaskQueue};
use crate::config::ServerConfig;

pub struct ScheduleEntry {
    pub name: &'static str,
    pub period: Duration,
    pub job: fn() -> Job,
}

pub struct Scheduler {
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    pub fn new(entries: Vec<ScheduleEntry>) -> Self {
        Self { entries }
    }

    /// Nightly maintenance, the contact watchdog and, when a threshold is
    /// configured, the free-space check.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut entries = vec![
            ScheduleEntry {
                name: "nightly",
                period: Duration::from_secs(config.vacuum_interval_secs),
                job: || Job::Nightly,
            },
            ScheduleEntry {
                name: "mark-timeout",
                period: Duration::from_secs(config.watchdog_interval_secs),
                job: || Job::Watchdog,
            },
        ];
        if config.free_space_threshold_percent.is_some() {
            entries.push(ScheduleEntry {
                name: "free-space",
                period: Duration::from_secs(config.free_space_interval_secs),
                job: || Job::CheckFreeSpace,
            });
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Start one timer per entry. A timer stops once the queue is closed.
    pub fn spawn(self, queue: TaskQueue) -> Vec<JoinHandle<()>> {
        self.entries
            .into_iter()
            .map(|entry| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    info!("Scheduling {} every {:?}", entry.name, entry.period);
                    let mut ticks = interval_at(Instant::now() + entry.period, entry.period);
                    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticks.tick().await;
                        if let Err(e) = queue.enqueue((entry.job)()) {
                            warn!("Stopping {}: {}", entry.name, e);
                            return;
                        }
                    }
                })
            })
            .collect()
    }
}
