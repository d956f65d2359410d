//! Daily rollover: archives each monitor's uptime and resets its counters
//! at UTC midnight.

use crate::db::Store;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct RolloverManager {
    store: Arc<Store>,
    keep_days: i64,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RolloverManager {
    pub fn new(store: Arc<Store>, keep_days: i64) -> Self {
        Self {
            store,
            keep_days,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the rollover background task.
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

            loop {
                let now = Utc::now();
                let wait = until_next_midnight(now);
                tracing::debug!("RolloverManager: Next rollover in {:?}", wait);

                tokio::select! {
                    _ = rx.recv() => break,
                    _ = tokio::time::sleep(wait) => {
                        roll_over(&store, closing_date(Utc::now()), keep_days);
                    }
                }
            }
        });
    }

    /// Stop the rollover manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn roll_over(store: &Store, date: NaiveDate, keep_days: i64) {
    match store.roll_over_daily(date, keep_days) {
        Ok(archived) => tracing::info!("RolloverManager: Archived uptime for {} monitors on {}", archived, date),
        Err(e) => tracing::error!("RolloverManager: Failed to roll over {}: {}", date, e),
    }
}

/// Time left until the next UTC midnight, never zero.
pub fn until_next_midnight(now: DateTime<Utc>) -> std::time::Duration {
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    let midnight = tomorrow.and_time(NaiveTime::MIN).and_utc();
    (midnight - now)
        .to_std()
        .unwrap_or_default()
        .max(std::time::Duration::from_millis(1))
}

/// The day being closed by a rollover that fires at `fired_at`.
///
/// The timer may fire marginally early or late, so the closest midnight
/// decides which day just ended.
pub fn closing_date(fired_at: DateTime<Utc>) -> NaiveDate {
    (fired_at + ChronoDuration::hours(12)).date_naive() - ChronoDuration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckResult, Monitor};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    #[test]
    fn test_until_next_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 30).unwrap();
        assert_eq!(until_next_midnight(now), std::time::Duration::from_secs(30));

        let midnight = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
        assert_eq!(until_next_midnight(midnight), std::time::Duration::from_secs(86_400));
    }

    #[test]
    fn test_closing_date() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let on_time = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
        assert_eq!(closing_date(on_time), day);
        assert_eq!(closing_date(on_time - ChronoDuration::milliseconds(5)), day);
        assert_eq!(closing_date(on_time + ChronoDuration::seconds(2)), day);
    }

    #[test]
    fn test_roll_over_archives_and_resets() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut monitor = Monitor {
            name: "web".to_string(),
            target: "https://example.com".to_string(),
            ..Default::default()
        };
        let id = store.add_monitor(&mut monitor).unwrap();

        let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        for (i, success) in [true, true, false, true].into_iter().enumerate() {
            let result = CheckResult {
                monitor_id: id,
                success,
                latency_ms: success.then_some(12),
                diagnostic: None,
                observed_at: start + ChronoDuration::seconds(i as i64),
            };
            store.record_check(&result, ChronoDuration::seconds(120)).unwrap();
        }

        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        roll_over(&store, day, 90);

        let archived = store.get_daily_uptime(id).unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].date, day);
        assert_eq!(archived[0].uptime_pct, 75.0);

        let status = store.get_current_status(id).unwrap().unwrap();
        assert_eq!(status.checks_today, 0);
        assert_eq!(status.successful_checks_today, 0);
        assert_eq!(status.today_uptime_pct, 100.0);
    }
}
