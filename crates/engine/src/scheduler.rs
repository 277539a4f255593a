//! Recurring maintenance tasks: queue drain, health check, auto-resolve, cleanup.
//!
//! Each task runs on its own tokio interval and can also be triggered directly
//! through [`Scheduler::run_task`], so tests never wait on wall-clock time.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use stocksync_core::EngineResult;

use crate::config::TimerSettings;
use crate::service::SyncService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    QueueDrain,
    HealthCheck,
    AutoResolve,
    Cleanup,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 4] = [
        MaintenanceTask::QueueDrain,
        MaintenanceTask::HealthCheck,
        MaintenanceTask::AutoResolve,
        MaintenanceTask::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceTask::QueueDrain => "queue_drain",
            MaintenanceTask::HealthCheck => "health_check",
            MaintenanceTask::AutoResolve => "auto_resolve",
            MaintenanceTask::Cleanup => "cleanup",
        }
    }

    pub fn interval(&self, timers: &TimerSettings) -> Duration {
        let secs = match self {
            MaintenanceTask::QueueDrain => timers.queue_drain_secs,
            MaintenanceTask::HealthCheck => timers.health_check_secs,
            MaintenanceTask::AutoResolve => timers.auto_resolve_secs,
            MaintenanceTask::Cleanup => timers.cleanup_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub runs: u64,
    pub failures: u64,
    /// Items handled across all runs (deliveries, health checks, conflicts, purged rows).
    pub items: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub tasks: BTreeMap<MaintenanceTask, TaskStats>,
}

impl SchedulerStats {
    pub fn runs(&self, task: MaintenanceTask) -> u64 {
        self.tasks.get(&task).map_or(0, |t| t.runs)
    }
}

/// Handle to the running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Stop every task after its current run and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "maintenance task panicked");
            }
        }
        info!("scheduler stopped");
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Spawn one interval loop per task on the current runtime.
    pub fn spawn(service: Arc<SyncService>, timers: &TimerSettings) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));

        let tasks = MaintenanceTask::ALL
            .into_iter()
            .map(|task| {
                let period = task.interval(timers);
                tokio::spawn(task_loop(
                    task,
                    period,
                    service.clone(),
                    shutdown_rx.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        info!(
            queue_drain_secs = timers.queue_drain_secs,
            health_check_secs = timers.health_check_secs,
            auto_resolve_secs = timers.auto_resolve_secs,
            cleanup_secs = timers.cleanup_secs,
            "scheduler started"
        );
        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks,
            stats,
        }
    }

    /// Run one task now. Returns how many items it handled.
    pub async fn run_task(service: &SyncService, task: MaintenanceTask) -> EngineResult<usize> {
        match task {
            MaintenanceTask::QueueDrain => {
                let reports = service.drain_queues().await;
                Ok(reports.iter().map(|r| r.delivered).sum())
            }
            MaintenanceTask::HealthCheck => Ok(service.check_channel_health().await?.len()),
            MaintenanceTask::AutoResolve => service.auto_resolve_conflicts().await,
            MaintenanceTask::Cleanup => Ok(service.cleanup_stale_data()?.total()),
        }
    }
}

async fn task_loop(
    task: MaintenanceTask,
    period: Duration,
    service: Arc<SyncService>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<SchedulerStats>>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let result = Scheduler::run_task(&service, task).await;
        let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.tasks.entry(task).or_default();
        entry.runs += 1;
        entry.last_run = Some(Utc::now());
        match result {
            Ok(items) => {
                entry.items += items as u64;
                debug!(task = task.as_str(), items, "maintenance task ran");
            }
            Err(err) => {
                entry.failures += 1;
                entry.last_error = Some(err.to_string());
                warn!(task = task.as_str(), error = %err, "maintenance task failed");
            }
        }
    }
    debug!(task = task.as_str(), "maintenance task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[tokio::test(start_paused = true)]
    async fn tasks_tick_on_their_intervals_until_shutdown() {
        let config = EngineConfig::default();
        let timers = config.timers.clone();
        let service = Arc::new(SyncService::builder(config).build().unwrap());

        let handle = Scheduler::spawn(service, &timers);
        tokio::time::sleep(Duration::from_secs(65)).await;

        let stats = handle.stats();
        assert_eq!(stats.runs(MaintenanceTask::QueueDrain), 6);
        assert_eq!(stats.runs(MaintenanceTask::AutoResolve), 2);
        assert_eq!(stats.runs(MaintenanceTask::HealthCheck), 1);
        assert_eq!(stats.runs(MaintenanceTask::Cleanup), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn run_task_is_callable_directly() {
        let service = SyncService::builder(EngineConfig::default()).build().unwrap();
        assert_eq!(Scheduler::run_task(&service, MaintenanceTask::QueueDrain).await.unwrap(), 0);
        assert_eq!(Scheduler::run_task(&service, MaintenanceTask::Cleanup).await.unwrap(), 0);
        assert_eq!(Scheduler::run_task(&service, MaintenanceTask::AutoResolve).await.unwrap(), 0);
    }
}
