//! Retention manager for trimming the check log.

use crate::db::Store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How often the check log is swept.
pub const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Manager for deleting check-log rows past their retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    keep_days: i64,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, keep_days: i64) -> Self {
        Self {
            store,
            keep_days,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();
        let keep_days = self.keep_days;

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            let mut rx = tx.subscribe();
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx);
            }

            let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        sweep_check_log(&store, keep_days, Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn sweep_check_log(store: &Store, keep_days: i64, now: DateTime<Utc>) -> usize {
    let cutoff = now - ChronoDuration::days(keep_days);
    match store.delete_check_log_before(cutoff) {
        Ok(deleted) => {
            if deleted > 0 {
                tracing::info!("RetentionManager: Deleted {} check-log rows before {}", deleted, cutoff);
            }
            deleted
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to trim check log: {}", e);
            0
        }
    }
}
