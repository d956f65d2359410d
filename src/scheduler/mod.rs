//! Scheduler module: one probe loop per running monitor, plus the
//! background maintenance managers.

mod retention;
mod rollover;

pub use retention::*;
pub use rollover::*;

use crate::db::{CheckResult, DbError, Monitor, RecordOutcome, Store};
use crate::monitor::ResultProcessor;
use crate::probe::{ProbeOutcome, Prober};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("monitor {0} not found")]
    MonitorNotFound(i64),
    #[error("monitor {id} is invalid: {reason}")]
    InvalidMonitor { id: i64, reason: String },
    #[error("store error: {0}")]
    Store(#[from] DbError),
}

struct MonitorTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the probe loops of all running monitors.
///
/// Control operations for one monitor are serialized by a per-monitor lock,
/// and a new loop never starts until the previous loop for the same monitor
/// has exited, so two loops for one monitor never coexist.
pub struct Scheduler {
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
    processor: Arc<ResultProcessor>,
    settle_delay: Duration,
    controls: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    tasks: Mutex<HashMap<i64, MonitorTask>>,
    // Stopped loops that may still be finishing an in-flight check.
    draining: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        prober: Arc<dyn Prober>,
        processor: Arc<ResultProcessor>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            store,
            prober,
            processor,
            settle_delay,
            controls: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            draining: Mutex::new(HashMap::new()),
        }
    }

    /// Start every active monitor. Returns how many were started.
    pub async fn start_all(&self) -> Result<usize, SchedulerError> {
        let monitors = self.store.get_active_monitors()?;
        tracing::info!("Starting scheduler with {} active monitors", monitors.len());

        let mut started = 0;
        for monitor in monitors {
            match self.start(monitor.id).await {
                Ok(()) => started += 1,
                Err(e) => tracing::error!(monitor_id = monitor.id, error = %e, "Failed to start monitor"),
            }
        }
        Ok(started)
    }

    /// Start watching a monitor, replacing any loop already running for it.
    pub async fn start(&self, id: i64) -> Result<(), SchedulerError> {
        let control = self.control(id);
        let _guard = control.lock().await;
        self.start_locked(id).await
    }

    /// Stop scheduling new checks. A check already in flight still completes
    /// and is recorded. No-op if the monitor is not running.
    pub async fn stop(&self, id: i64) {
        let control = self.control(id);
        let _guard = control.lock().await;
        self.stop_locked(id);
    }

    /// Stop, wait for the settle delay, then start with a fresh definition.
    pub async fn restart(&self, id: i64) -> Result<(), SchedulerError> {
        let control = self.control(id);
        let _guard = control.lock().await;
        self.stop_locked(id);
        tokio::time::sleep(self.settle_delay).await;
        self.start_locked(id).await
    }

    /// Stop every loop and wait for in-flight checks to finish.
    pub async fn stop_all(&self) {
        let ids: Vec<i64> = lock(&self.tasks).keys().copied().collect();
        for id in &ids {
            self.stop(*id).await;
        }

        let handles: Vec<(i64, JoinHandle<()>)> = lock(&self.draining).drain().collect();
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!(monitor_id = id, error = %e, "Monitor task ended abnormally");
            }
        }
        tracing::info!("Scheduler stopped {} monitors", ids.len());
    }

    /// Drop per-monitor bookkeeping for a monitor that has been deleted.
    ///
    /// Loops that are still finishing a check stay tracked until they exit.
    pub fn forget(&self, id: i64) {
        self.prune_finished();
        let mut controls = lock(&self.controls);
        // Only the map holds the lock: no control operation is in progress.
        if controls.get(&id).is_some_and(|c| Arc::strong_count(c) == 1) {
            controls.remove(&id);
        }
    }

    pub fn is_running(&self, id: i64) -> bool {
        lock(&self.tasks).get(&id).is_some_and(|t| !t.handle.is_finished())
    }

    /// Number of monitors with a live probe loop.
    pub fn active_count(&self) -> usize {
        lock(&self.tasks).values().filter(|t| !t.handle.is_finished()).count()
    }

    fn control(&self, id: i64) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.controls).entry(id).or_default().clone()
    }

    async fn start_locked(&self, id: i64) -> Result<(), SchedulerError> {
        self.stop_locked(id);
        let previous = lock(&self.draining).remove(&id);
        if let Some(handle) = previous {
            if let Err(e) = handle.await {
                tracing::error!(monitor_id = id, error = %e, "Previous monitor task ended abnormally");
            }
        }

        let monitor = match self.store.get_monitor(id) {
            Ok(m) => m,
            Err(DbError::NotFound) => {
                tracing::error!(monitor_id = id, "Cannot start monitor: not found");
                return Err(SchedulerError::MonitorNotFound(id));
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(reason) = monitor.validate() {
            tracing::error!(monitor_id = id, "Cannot start monitor: {}", reason);
            return Err(SchedulerError::InvalidMonitor { id, reason });
        }

        tracing::info!(
            monitor_id = id,
            "Scheduler: starting {} ({} {}) every {}s",
            monitor.name,
            monitor.kind,
            monitor.target,
            monitor.interval_seconds
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_monitor_loop(
            monitor,
            self.prober.clone(),
            self.processor.clone(),
            stop_rx,
        ));
        lock(&self.tasks).insert(id, MonitorTask { stop_tx, handle });
        Ok(())
    }

    fn prune_finished(&self) {
        lock(&self.tasks).retain(|_, t| !t.handle.is_finished());
        lock(&self.draining).retain(|_, h| !h.is_finished());
    }

    fn stop_locked(&self, id: i64) {
        self.prune_finished();
        let Some(task) = lock(&self.tasks).remove(&id) else {
            return;
        };
        let _ = task.stop_tx.send(true);
        if !task.handle.is_finished() {
            tracing::info!(monitor_id = id, "Scheduler: stopped monitor");
        }
        lock(&self.draining).insert(id, task.handle);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run the probe loop for a single monitor.
///
/// Ticks are handled one at a time; ticks missed while a check overruns the
/// interval are skipped rather than queued.
async fn run_monitor_loop(
    monitor: Monitor,
    prober: Arc<dyn Prober>,
    processor: Arc<ResultProcessor>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let monitor = Arc::new(monitor);
    let mut interval = tokio::time::interval(Duration::from_secs(u64::from(monitor.interval_seconds)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = interval.tick() => {
                let result = run_check(&monitor, &prober).await;
                match processor.process(&monitor, &result) {
                    Ok(RecordOutcome::MonitorGone) => break,
                    Ok(_) => {}
                    Err(e) => tracing::error!(monitor_id = monitor.id, error = %e, "Check abandoned"),
                }
            }
        }
    }

    tracing::debug!(monitor_id = monitor.id, "Monitor loop exited");
}

/// Probe once. A panicking prober counts as a failed check.
async fn run_check(monitor: &Arc<Monitor>, prober: &Arc<dyn Prober>) -> CheckResult {
    let observed_at = Utc::now();

    let task_monitor = monitor.clone();
    let task_prober = prober.clone();
    let outcome = tokio::spawn(async move { task_prober.probe(&task_monitor).await })
        .await
        .unwrap_or_else(|e| {
            tracing::error!(monitor_id = monitor.id, error = %e, "Probe task failed");
            ProbeOutcome::down(join_error_text(e))
        });

    CheckResult {
        monitor_id: monitor.id,
        success: outcome.success,
        latency_ms: outcome.latency_ms,
        diagnostic: outcome.diagnostic,
        observed_at,
    }
}

fn join_error_text(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("probe panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("probe panicked: {}", s)
    } else {
        "probe panicked".to_string()
    }
}
