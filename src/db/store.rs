//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::monitor::{plan_transition, IncidentChange, MonitorSnapshot, PendingChange, TransitionPlan};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const DB_DATE_FORMAT: &str = "%Y-%m-%d";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Connection lock poisoned")]
    Poisoned,
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result of recording one check.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// The check was logged and the plan was applied.
    Applied(TransitionPlan),
    /// A check with the same timestamp is already logged.
    Duplicate,
    /// The check is older than the last one applied.
    Stale,
    /// The monitor was deleted while the probe was in flight.
    MonitorGone,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Bring the schema up to date.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Monitor CRUD ---

    /// Add a new monitor and return its ID.
    pub fn add_monitor(&self, monitor: &mut Monitor) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO monitors (owner_id, name, target, kind, port, interval_seconds, webhook_url, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                monitor.owner_id,
                monitor.name,
                monitor.target,
                monitor.kind.as_str(),
                monitor.port,
                monitor.interval_seconds,
                monitor.webhook_url,
                monitor.active,
            ],
        )?;
        let id = conn.last_insert_rowid();
        monitor.id = id;
        Ok(id)
    }

    /// Update an existing monitor definition. Monitors are edited by the
    /// dashboard; this exists for tests.
    #[cfg(test)]
    pub fn update_monitor(&self, monitor: &Monitor) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE monitors SET owner_id=?1, name=?2, target=?3, kind=?4, port=?5, interval_seconds=?6,
             webhook_url=?7, active=?8 WHERE id=?9",
            params![
                monitor.owner_id,
                monitor.name,
                monitor.target,
                monitor.kind.as_str(),
                monitor.port,
                monitor.interval_seconds,
                monitor.webhook_url,
                monitor.active,
                monitor.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all monitors.
    pub fn get_monitors(&self) -> Result<Vec<Monitor>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY id", MONITOR_SELECT))?;
        let monitors = stmt
            .query_map([], monitor_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(monitors)
    }

    /// Get the monitors that should be scheduled at boot.
    pub fn get_active_monitors(&self) -> Result<Vec<Monitor>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE active = 1 ORDER BY id", MONITOR_SELECT))?;
        let monitors = stmt
            .query_map([], monitor_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(monitors)
    }

    /// Get a monitor by ID.
    pub fn get_monitor(&self, id: i64) -> Result<Monitor, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{} WHERE id = ?1", MONITOR_SELECT),
            params![id],
            monitor_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a monitor. Status, pending outage, incidents, check log and
    /// daily uptime rows go with it.
    pub fn delete_monitor(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Check processing ---

    /// Log a check and apply its state transition in one transaction.
    ///
    /// Either the check-log row, the status row, the pending outage and the
    /// incident ledger are all written, or none of them are.
    pub fn record_check(
        &self,
        result: &CheckResult,
        confirmation_window: ChronoDuration,
    ) -> Result<RecordOutcome, DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM monitors WHERE id = ?1)",
            params![result.monitor_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(RecordOutcome::MonitorGone);
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO check_log (monitor_id, success, latency_ms, diagnostic, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.monitor_id,
                result.success,
                result.latency_ms,
                result.diagnostic,
                fmt_db_time(result.observed_at),
            ],
        )?;
        if inserted == 0 {
            return Ok(RecordOutcome::Duplicate);
        }

        let snapshot = load_snapshot(&tx, result.monitor_id)?;
        if let Some(prior) = &snapshot {
            if result.observed_at < prior.status.last_check_at {
                return Ok(RecordOutcome::Stale);
            }
        }

        let plan = plan_transition(snapshot.as_ref(), result, confirmation_window);
        apply_plan(&tx, &plan)?;
        tx.commit()?;

        Ok(RecordOutcome::Applied(plan))
    }

    // --- Status reads ---

    /// Get the current status row, if the monitor has ever been checked.
    pub fn get_current_status(&self, monitor_id: i64) -> Result<Option<CurrentStatus>, DbError> {
        let conn = self.conn()?;
        Ok(query_current_status(&conn, monitor_id)?)
    }

    pub fn get_pending_outage(&self, monitor_id: i64) -> Result<Option<PendingOutage>, DbError> {
        let conn = self.conn()?;
        Ok(query_pending_outage(&conn, monitor_id)?)
    }

    pub fn get_open_incident(&self, monitor_id: i64) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        Ok(query_open_incident(&conn, monitor_id)?)
    }

    /// Get incidents for a monitor, newest first.
    pub fn get_incidents(&self, monitor_id: i64, limit: i64) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, started_at, ended_at, diagnostic, duration_seconds
             FROM incidents WHERE monitor_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
        )?;
        let incidents = stmt
            .query_map(params![monitor_id, limit], incident_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(incidents)
    }

    /// Get the `limit` most recent logged checks for a monitor, oldest first.
    pub fn get_check_log(&self, monitor_id: i64, limit: i64) -> Result<Vec<CheckResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT monitor_id, success, latency_ms, diagnostic, observed_at FROM (
                 SELECT * FROM check_log WHERE monitor_id = ?1 ORDER BY observed_at DESC LIMIT ?2
             ) ORDER BY observed_at ASC",
        )?;
        let checks = stmt
            .query_map(params![monitor_id, limit], |row| {
                Ok(CheckResult {
                    monitor_id: row.get(0)?,
                    success: row.get(1)?,
                    latency_ms: row.get(2)?,
                    diagnostic: row.get(3)?,
                    observed_at: time_col(row, 4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(checks)
    }

    /// Aggregate the check log from `since` onwards.
    pub fn get_stats(&self, monitor_id: i64, since: DateTime<Utc>) -> Result<MonitorStats, DbError> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0), AVG(latency_ms), MIN(latency_ms), MAX(latency_ms)
             FROM check_log WHERE monitor_id = ?1 AND observed_at >= ?2",
            params![monitor_id, fmt_db_time(since)],
            |row| {
                let checks: i64 = row.get(0)?;
                let successes: i64 = row.get(1)?;
                Ok(MonitorStats {
                    checks,
                    successes,
                    avg_latency_ms: row.get(2)?,
                    min_latency_ms: row.get(3)?,
                    max_latency_ms: row.get(4)?,
                    uptime_pct: (checks > 0).then(|| successes as f64 * 100.0 / checks as f64),
                })
            },
        )?;
        Ok(stats)
    }

    // --- Daily rollover and retention ---

    /// Archive every monitor's uptime for `date`, reset the daily counters
    /// and drop archived days older than `keep_days`.
    ///
    /// Returns the number of monitors archived.
    pub fn roll_over_daily(&self, date: NaiveDate, keep_days: i64) -> Result<usize, DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let archived = tx.execute(
            "INSERT OR REPLACE INTO daily_uptime (monitor_id, date, uptime_pct)
             SELECT monitor_id, ?1, today_uptime_pct FROM current_status",
            params![date.format(DB_DATE_FORMAT).to_string()],
        )?;
        tx.execute(
            "UPDATE current_status SET checks_today = 0, successful_checks_today = 0, today_uptime_pct = 100.0",
            [],
        )?;
        let cutoff = date - ChronoDuration::days(keep_days);
        tx.execute(
            "DELETE FROM daily_uptime WHERE date < ?1",
            params![cutoff.format(DB_DATE_FORMAT).to_string()],
        )?;

        tx.commit()?;
        Ok(archived)
    }

    /// Get archived daily uptime for a monitor, oldest first.
    pub fn get_daily_uptime(&self, monitor_id: i64) -> Result<Vec<DailyUptime>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT monitor_id, date, uptime_pct FROM daily_uptime WHERE monitor_id = ?1 ORDER BY date ASC",
        )?;
        let days = stmt
            .query_map(params![monitor_id], |row| {
                let date_str: String = row.get(1)?;
                let date = NaiveDate::parse_from_str(&date_str, DB_DATE_FORMAT)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
                Ok(DailyUptime {
                    monitor_id: row.get(0)?,
                    date,
                    uptime_pct: row.get(2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(days)
    }

    /// Delete check-log rows older than the cutoff.
    pub fn delete_check_log_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM check_log WHERE observed_at < ?1",
            params![fmt_db_time(cutoff)],
        )?;
        Ok(deleted)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), DbError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }
}

const MONITOR_SELECT: &str =
    "SELECT id, owner_id, name, target, kind, port, interval_seconds, webhook_url, active FROM monitors";

fn monitor_from_row(row: &Row<'_>) -> SqlResult<Monitor> {
    let kind_str: String = row.get(4)?;
    let kind = kind_str
        .parse::<MonitorKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?;
    Ok(Monitor {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        target: row.get(3)?,
        kind,
        port: row.get(5)?,
        interval_seconds: row.get(6)?,
        webhook_url: row.get(7)?,
        active: row.get(8)?,
    })
}

fn incident_from_row(row: &Row<'_>) -> SqlResult<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        started_at: time_col(row, 2)?,
        ended_at: opt_time_col(row, 3)?,
        diagnostic: row.get(4)?,
        duration_seconds: row.get(5)?,
    })
}

fn query_current_status(conn: &Connection, monitor_id: i64) -> SqlResult<Option<CurrentStatus>> {
    conn.query_row(
        "SELECT monitor_id, is_up, status_since, last_check_at, last_latency_ms, last_diagnostic,
                checks_today, successful_checks_today, today_uptime_pct
         FROM current_status WHERE monitor_id = ?1",
        params![monitor_id],
        |row| {
            Ok(CurrentStatus {
                monitor_id: row.get(0)?,
                is_up: row.get(1)?,
                status_since: time_col(row, 2)?,
                last_check_at: time_col(row, 3)?,
                last_latency_ms: row.get(4)?,
                last_diagnostic: row.get(5)?,
                checks_today: row.get(6)?,
                successful_checks_today: row.get(7)?,
                today_uptime_pct: row.get(8)?,
            })
        },
    )
    .optional()
}

fn query_pending_outage(conn: &Connection, monitor_id: i64) -> SqlResult<Option<PendingOutage>> {
    conn.query_row(
        "SELECT monitor_id, started_at, diagnostic FROM pending_outages WHERE monitor_id = ?1",
        params![monitor_id],
        |row| {
            Ok(PendingOutage {
                monitor_id: row.get(0)?,
                started_at: time_col(row, 1)?,
                diagnostic: row.get(2)?,
            })
        },
    )
    .optional()
}

fn query_open_incident(conn: &Connection, monitor_id: i64) -> SqlResult<Option<Incident>> {
    conn.query_row(
        "SELECT id, monitor_id, started_at, ended_at, diagnostic, duration_seconds
         FROM incidents WHERE monitor_id = ?1 AND ended_at IS NULL",
        params![monitor_id],
        incident_from_row,
    )
    .optional()
}

fn load_snapshot(tx: &Transaction<'_>, monitor_id: i64) -> SqlResult<Option<MonitorSnapshot>> {
    let Some(status) = query_current_status(tx, monitor_id)? else {
        return Ok(None);
    };
    Ok(Some(MonitorSnapshot {
        status,
        pending: query_pending_outage(tx, monitor_id)?,
        open_incident: query_open_incident(tx, monitor_id)?,
    }))
}

fn apply_plan(tx: &Transaction<'_>, plan: &TransitionPlan) -> Result<(), DbError> {
    let s = &plan.status;
    tx.execute(
        "INSERT INTO current_status (monitor_id, is_up, status_since, last_check_at, last_latency_ms,
                                     last_diagnostic, checks_today, successful_checks_today, today_uptime_pct)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(monitor_id) DO UPDATE SET
            is_up=excluded.is_up, status_since=excluded.status_since, last_check_at=excluded.last_check_at,
            last_latency_ms=excluded.last_latency_ms, last_diagnostic=excluded.last_diagnostic,
            checks_today=excluded.checks_today, successful_checks_today=excluded.successful_checks_today,
            today_uptime_pct=excluded.today_uptime_pct",
        params![
            s.monitor_id,
            s.is_up,
            fmt_db_time(s.status_since),
            fmt_db_time(s.last_check_at),
            s.last_latency_ms,
            s.last_diagnostic,
            s.checks_today,
            s.successful_checks_today,
            s.today_uptime_pct,
        ],
    )?;

    match &plan.pending {
        PendingChange::Keep => {}
        PendingChange::Open(pending) => {
            tx.execute(
                "INSERT OR REPLACE INTO pending_outages (monitor_id, started_at, diagnostic) VALUES (?1, ?2, ?3)",
                params![pending.monitor_id, fmt_db_time(pending.started_at), pending.diagnostic],
            )?;
        }
        PendingChange::Discard => {
            tx.execute(
                "DELETE FROM pending_outages WHERE monitor_id = ?1",
                params![s.monitor_id],
            )?;
        }
    }

    match &plan.incident {
        IncidentChange::None => {}
        IncidentChange::Open { started_at, diagnostic } => {
            tx.execute(
                "INSERT INTO incidents (monitor_id, started_at, diagnostic) VALUES (?1, ?2, ?3)",
                params![s.monitor_id, fmt_db_time(*started_at), diagnostic],
            )?;
        }
        IncidentChange::Close {
            id,
            ended_at,
            duration_seconds,
        } => {
            let closed = tx.execute(
                "UPDATE incidents SET ended_at = ?1, duration_seconds = ?2 WHERE id = ?3 AND ended_at IS NULL",
                params![fmt_db_time(*ended_at), duration_seconds, id],
            )?;
            if closed != 1 {
                return Err(DbError::InvalidData(format!("incident {} is not open", id)));
            }
        }
    }

    Ok(())
}

fn fmt_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("bad timestamp: {}", s).into())
    })
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(_) => time_col(row, idx).map(Some),
        None => Ok(None),
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
