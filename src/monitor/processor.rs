//! Applies check results to the store and fires notifications.

use chrono::Duration;
use std::sync::Arc;
use thiserror::Error;

use super::StatusEvent;
use crate::db::{CheckResult, DbError, Monitor, RecordOutcome, Store};
use crate::notify::NotificationDispatcher;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("store update failed after retry: {0}")]
    Store(#[from] DbError),
}

pub struct ResultProcessor {
    store: Arc<Store>,
    dispatcher: NotificationDispatcher,
    confirmation_window: Duration,
}

impl ResultProcessor {
    pub fn new(store: Arc<Store>, dispatcher: NotificationDispatcher, confirmation_window: Duration) -> Self {
        Self {
            store,
            dispatcher,
            confirmation_window,
        }
    }

    /// Record one check and act on the resulting transition.
    ///
    /// A failed store transaction is retried once. If the retry fails too
    /// nothing was written and the error is returned; the next tick starts
    /// again from the last committed state.
    pub fn process(&self, monitor: &Monitor, result: &CheckResult) -> Result<RecordOutcome, ProcessError> {
        let outcome = match self.store.record_check(result, self.confirmation_window) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(monitor_id = monitor.id, error = %e, "Recording check failed, retrying");
                self.store.record_check(result, self.confirmation_window).map_err(|e| {
                    tracing::error!(monitor_id = monitor.id, error = %e, "Recording check failed, abandoning tick");
                    ProcessError::Store(e)
                })?
            }
        };

        match &outcome {
            RecordOutcome::Applied(plan) => self.handle_event(monitor, result, &plan.event),
            RecordOutcome::Duplicate => {
                tracing::debug!(monitor_id = monitor.id, "Ignoring replayed check at {}", result.observed_at)
            }
            RecordOutcome::Stale => tracing::warn!(
                monitor_id = monitor.id,
                "Dropping check at {} older than the last recorded check",
                result.observed_at
            ),
            RecordOutcome::MonitorGone => {
                tracing::info!(monitor_id = monitor.id, "Monitor was deleted, dropping result")
            }
        }

        Ok(outcome)
    }

    fn handle_event(&self, monitor: &Monitor, result: &CheckResult, event: &StatusEvent) {
        match event {
            StatusEvent::None => {}
            StatusEvent::FirstCheck => tracing::debug!(
                monitor_id = monitor.id,
                up = result.success,
                "First check for {}",
                monitor.name
            ),
            StatusEvent::OutageOpened => tracing::info!(
                monitor_id = monitor.id,
                "{} failed a check, awaiting confirmation: {}",
                monitor.name,
                result.diagnostic.as_deref().unwrap_or("no diagnostic")
            ),
            StatusEvent::BlipCleared { started_at } => tracing::info!(
                monitor_id = monitor.id,
                "{} recovered before confirmation (blip since {})",
                monitor.name,
                started_at
            ),
            StatusEvent::OutageConfirmed { started_at, diagnostic } => {
                tracing::warn!(monitor_id = monitor.id, "{} is DOWN since {}", monitor.name, started_at);
                self.dispatcher
                    .notify(monitor, false, diagnostic.clone(), result.observed_at);
            }
            StatusEvent::Recovered {
                incident_id,
                duration_seconds,
            } => {
                tracing::info!(
                    monitor_id = monitor.id,
                    incident_id,
                    "{} is UP after {}s of downtime",
                    monitor.name,
                    duration_seconds
                );
                self.dispatcher
                    .notify(monitor, true, result.diagnostic.clone(), result.observed_at);
            }
        }
    }
}
