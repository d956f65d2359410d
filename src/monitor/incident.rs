//! Incident state machine.
//!
//! Turns one raw check result plus the monitor's persisted state into a
//! [`TransitionPlan`]: the new status row and the changes to apply to the
//! pending outage and incident ledger. Planning is pure; the store applies a
//! plan inside the same transaction that loaded the snapshot.
//!
//! A monitor is always in exactly one of these states:
//!
//! - **Stable-Up**: up, nothing pending, no open incident.
//! - **Contested-Down**: failing but not yet confirmed. Surfaces as down, a
//!   pending outage records when the streak began.
//! - **Stable-Down**: confirmed outage with an open incident.
//! - **Unconfirmed-Down**: the very first check failed, so there is no prior
//!   up-streak to contest.
//!
//! A failing streak becomes an incident once it has lasted for the
//! confirmation window. A streak that recovers earlier is a blip and leaves
//! `status_since` and the ledger untouched.

use chrono::{DateTime, Duration, Utc};

use crate::db::{CheckResult, CurrentStatus, Incident, PendingOutage};

/// Minimum continuous-failure duration before an outage is confirmed.
pub const DEFAULT_CONFIRMATION_WINDOW_SECS: i64 = 120;

/// Persisted state of one monitor, read inside the check transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSnapshot {
    pub status: CurrentStatus,
    pub pending: Option<PendingOutage>,
    pub open_incident: Option<Incident>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    StableUp,
    ContestedDown,
    StableDown,
    UnconfirmedDown,
}

impl MonitorSnapshot {
    /// Derive the state. An open incident wins over everything else, so a
    /// leftover pending row can never mask a confirmed outage.
    pub fn state(&self) -> MonitorState {
        if self.open_incident.is_some() {
            MonitorState::StableDown
        } else if self.pending.is_some() {
            MonitorState::ContestedDown
        } else if self.status.is_up {
            MonitorState::StableUp
        } else {
            MonitorState::UnconfirmedDown
        }
    }
}

/// What to do with the monitor's pending-outage row.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingChange {
    Keep,
    Open(PendingOutage),
    Discard,
}

/// What to do with the monitor's incident ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum IncidentChange {
    None,
    Open {
        started_at: DateTime<Utc>,
        diagnostic: Option<String>,
    },
    Close {
        id: i64,
        ended_at: DateTime<Utc>,
        duration_seconds: i64,
    },
}

/// The observable effect of a check, used for logging and notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    None,
    FirstCheck,
    OutageOpened,
    OutageConfirmed {
        started_at: DateTime<Utc>,
        diagnostic: Option<String>,
    },
    BlipCleared {
        started_at: DateTime<Utc>,
    },
    Recovered {
        incident_id: i64,
        duration_seconds: i64,
    },
}

impl StatusEvent {
    /// Confirmed transitions are the only ones that notify.
    pub fn is_confirmed_transition(&self) -> bool {
        matches!(
            self,
            StatusEvent::OutageConfirmed { .. } | StatusEvent::Recovered { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    pub status: CurrentStatus,
    pub pending: PendingChange,
    pub incident: IncidentChange,
    pub event: StatusEvent,
}

/// Uptime percentage for the day's counters. No checks reads as fully up.
pub fn uptime_pct(successes: i64, checks: i64) -> f64 {
    if checks <= 0 {
        return 100.0;
    }
    (successes as f64 * 100.0) / checks as f64
}

/// Plan the effect of `result` on a monitor whose persisted state is `prior`.
pub fn plan_transition(
    prior: Option<&MonitorSnapshot>,
    result: &CheckResult,
    confirmation_window: Duration,
) -> TransitionPlan {
    let now = result.observed_at;

    let Some(prior) = prior else {
        let successes = i64::from(result.success);
        return TransitionPlan {
            status: CurrentStatus {
                monitor_id: result.monitor_id,
                is_up: result.success,
                status_since: now,
                last_check_at: now,
                last_latency_ms: result.latency_ms,
                last_diagnostic: result.diagnostic.clone(),
                checks_today: 1,
                successful_checks_today: successes,
                today_uptime_pct: uptime_pct(successes, 1),
            },
            pending: PendingChange::Keep,
            incident: IncidentChange::None,
            event: StatusEvent::FirstCheck,
        };
    };

    let mut status = prior.status.clone();
    record_check(&mut status, result);

    match (prior.state(), result.success) {
        (MonitorState::StableUp, true) => TransitionPlan {
            status,
            pending: PendingChange::Keep,
            incident: IncidentChange::None,
            event: StatusEvent::None,
        },
        (MonitorState::StableUp, false) => {
            status.is_up = false;
            TransitionPlan {
                status,
                pending: PendingChange::Open(PendingOutage {
                    monitor_id: result.monitor_id,
                    started_at: now,
                    diagnostic: result.diagnostic.clone(),
                }),
                incident: IncidentChange::None,
                event: StatusEvent::OutageOpened,
            }
        }
        (MonitorState::ContestedDown, false) => {
            status.is_up = false;
            match prior.pending.as_ref() {
                Some(pending) => confirm_if_due(
                    status,
                    pending.started_at,
                    pending.diagnostic.clone().or_else(|| result.diagnostic.clone()),
                    now,
                    confirmation_window,
                    PendingChange::Keep,
                ),
                None => TransitionPlan {
                    status,
                    pending: PendingChange::Keep,
                    incident: IncidentChange::None,
                    event: StatusEvent::None,
                },
            }
        }
        (MonitorState::ContestedDown, true) => {
            // The streak never crossed the window: the up-streak is unbroken.
            status.is_up = true;
            let started_at = prior
                .pending
                .as_ref()
                .map(|p| p.started_at)
                .unwrap_or(now);
            // A streak dating back to the first check had no up-streak to keep.
            if started_at <= prior.status.status_since {
                status.status_since = now;
            }
            TransitionPlan {
                status,
                pending: PendingChange::Discard,
                incident: IncidentChange::None,
                event: StatusEvent::BlipCleared { started_at },
            }
        }
        (MonitorState::StableDown, true) => {
            status.is_up = true;
            status.status_since = now;
            match prior.open_incident.as_ref() {
                Some(incident) => {
                    let duration_seconds = (now - incident.started_at).num_seconds().max(0);
                    TransitionPlan {
                        status,
                        pending: PendingChange::Discard,
                        incident: IncidentChange::Close {
                            id: incident.id,
                            ended_at: now,
                            duration_seconds,
                        },
                        event: StatusEvent::Recovered {
                            incident_id: incident.id,
                            duration_seconds,
                        },
                    }
                }
                None => TransitionPlan {
                    status,
                    pending: PendingChange::Discard,
                    incident: IncidentChange::None,
                    event: StatusEvent::None,
                },
            }
        }
        (MonitorState::StableDown, false) => {
            status.is_up = false;
            let pending = if prior.pending.is_some() {
                PendingChange::Discard
            } else {
                PendingChange::Keep
            };
            TransitionPlan {
                status,
                pending,
                incident: IncidentChange::None,
                event: StatusEvent::None,
            }
        }
        (MonitorState::UnconfirmedDown, true) => {
            status.is_up = true;
            status.status_since = now;
            TransitionPlan {
                status,
                pending: PendingChange::Keep,
                incident: IncidentChange::None,
                event: StatusEvent::None,
            }
        }
        (MonitorState::UnconfirmedDown, false) => {
            // The streak began with the very first check.
            let started_at = prior.status.status_since;
            let diagnostic = prior
                .status
                .last_diagnostic
                .clone()
                .or_else(|| result.diagnostic.clone());
            let pending = PendingChange::Open(PendingOutage {
                monitor_id: result.monitor_id,
                started_at,
                diagnostic: diagnostic.clone(),
            });
            confirm_if_due(status, started_at, diagnostic, now, confirmation_window, pending)
        }
    }
}

fn record_check(status: &mut CurrentStatus, result: &CheckResult) {
    status.last_check_at = result.observed_at;
    status.last_latency_ms = result.latency_ms;
    status.last_diagnostic = result.diagnostic.clone();
    status.checks_today += 1;
    if result.success {
        status.successful_checks_today += 1;
    }
    status.today_uptime_pct = uptime_pct(status.successful_checks_today, status.checks_today);
}

fn confirm_if_due(
    mut status: CurrentStatus,
    started_at: DateTime<Utc>,
    diagnostic: Option<String>,
    now: DateTime<Utc>,
    confirmation_window: Duration,
    unconfirmed_pending: PendingChange,
) -> TransitionPlan {
    if now - started_at < confirmation_window {
        return TransitionPlan {
            status,
            pending: unconfirmed_pending,
            incident: IncidentChange::None,
            event: StatusEvent::None,
        };
    }

    status.status_since = started_at;
    TransitionPlan {
        status,
        pending: PendingChange::Discard,
        incident: IncidentChange::Open {
            started_at,
            diagnostic: diagnostic.clone(),
        },
        event: StatusEvent::OutageConfirmed {
            started_at,
            diagnostic,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MONITOR: i64 = 7;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn check(secs: i64, success: bool) -> CheckResult {
        CheckResult {
            monitor_id: MONITOR,
            success,
            latency_ms: success.then_some(42),
            diagnostic: (!success).then(|| format!("connection refused at {}", secs)),
            observed_at: at(secs),
        }
    }

    fn window() -> Duration {
        Duration::seconds(DEFAULT_CONFIRMATION_WINDOW_SECS)
    }

    /// In-memory stand-in for the store's apply step.
    struct Ledger {
        snapshot: Option<MonitorSnapshot>,
        incidents: Vec<Incident>,
        events: Vec<StatusEvent>,
    }

    impl Ledger {
        fn new() -> Self {
            Self {
                snapshot: None,
                incidents: Vec::new(),
                events: Vec::new(),
            }
        }

        fn feed(&mut self, secs: i64, success: bool) {
            let plan = plan_transition(self.snapshot.as_ref(), &check(secs, success), window());
            let mut pending = self.snapshot.as_ref().and_then(|s| s.pending.clone());
            match plan.pending {
                PendingChange::Keep => {}
                PendingChange::Open(p) => pending = Some(p),
                PendingChange::Discard => pending = None,
            }
            match plan.incident {
                IncidentChange::None => {}
                IncidentChange::Open { started_at, diagnostic } => {
                    self.incidents.push(Incident {
                        id: self.incidents.len() as i64 + 1,
                        monitor_id: MONITOR,
                        started_at,
                        ended_at: None,
                        diagnostic,
                        duration_seconds: None,
                    });
                }
                IncidentChange::Close { id, ended_at, duration_seconds } => {
                    let incident = self.incidents.iter_mut().find(|i| i.id == id).unwrap();
                    incident.ended_at = Some(ended_at);
                    incident.duration_seconds = Some(duration_seconds);
                }
            }
            assert!(self.incidents.iter().filter(|i| i.is_open()).count() <= 1);
            self.snapshot = Some(MonitorSnapshot {
                status: plan.status,
                pending,
                open_incident: self.incidents.iter().find(|i| i.is_open()).cloned(),
            });
            self.events.push(plan.event);
        }

        fn status(&self) -> &CurrentStatus {
            &self.snapshot.as_ref().unwrap().status
        }

        fn state(&self) -> MonitorState {
            self.snapshot.as_ref().unwrap().state()
        }
    }

    #[test]
    fn test_first_check_initialises_status() {
        let plan = plan_transition(None, &check(0, true), window());
        assert!(plan.status.is_up);
        assert_eq!(plan.status.status_since, at(0));
        assert_eq!(plan.status.checks_today, 1);
        assert_eq!(plan.status.successful_checks_today, 1);
        assert_eq!(plan.status.today_uptime_pct, 100.0);
        assert_eq!(plan.incident, IncidentChange::None);
        assert_eq!(plan.event, StatusEvent::FirstCheck);

        let plan = plan_transition(None, &check(0, false), window());
        assert!(!plan.status.is_up);
        assert_eq!(plan.status.successful_checks_today, 0);
        assert_eq!(plan.status.today_uptime_pct, 0.0);
        assert_eq!(plan.pending, PendingChange::Keep);
        assert_eq!(plan.incident, IncidentChange::None);
    }

    #[test]
    fn test_confirmed_outage_scenario() {
        let mut ledger = Ledger::new();
        ledger.feed(0, true);
        ledger.feed(30, false);
        assert_eq!(ledger.state(), MonitorState::ContestedDown);
        assert!(!ledger.status().is_up);
        assert_eq!(ledger.status().status_since, at(0));

        ledger.feed(90, false);
        assert_eq!(ledger.state(), MonitorState::ContestedDown);
        assert!(ledger.incidents.is_empty());

        ledger.feed(150, false);
        assert_eq!(ledger.state(), MonitorState::StableDown);
        assert_eq!(ledger.incidents.len(), 1);
        assert_eq!(ledger.incidents[0].started_at, at(30));
        assert_eq!(ledger.status().status_since, at(30));
        assert!(ledger.events[3].is_confirmed_transition());

        ledger.feed(210, true);
        assert_eq!(ledger.state(), MonitorState::StableUp);
        assert_eq!(ledger.incidents.len(), 1);
        assert_eq!(ledger.incidents[0].ended_at, Some(at(210)));
        assert_eq!(ledger.incidents[0].duration_seconds, Some(180));
        assert_eq!(ledger.status().status_since, at(210));
        assert!(ledger.status().is_up);
        assert_eq!(
            ledger.events[4],
            StatusEvent::Recovered {
                incident_id: 1,
                duration_seconds: 180
            }
        );
    }

    #[test]
    fn test_blip_is_suppressed() {
        let mut ledger = Ledger::new();
        ledger.feed(0, true);
        ledger.feed(60, false);
        ledger.feed(90, true);

        assert!(ledger.incidents.is_empty());
        assert_eq!(ledger.state(), MonitorState::StableUp);
        assert_eq!(ledger.status().status_since, at(0));
        assert_eq!(ledger.events[2], StatusEvent::BlipCleared { started_at: at(60) });
        assert!(ledger.events.iter().all(|e| !e.is_confirmed_transition()));
    }

    #[test]
    fn test_confirmation_uses_first_failure_time() {
        let mut ledger = Ledger::new();
        ledger.feed(0, true);
        ledger.feed(10, false);
        ledger.feed(129, false);
        assert!(ledger.incidents.is_empty());
        ledger.feed(130, false);
        assert_eq!(ledger.incidents.len(), 1);
        assert_eq!(ledger.incidents[0].started_at, at(10));
        assert_eq!(
            ledger.incidents[0].diagnostic.as_deref(),
            Some("connection refused at 10")
        );
    }

    #[test]
    fn test_stable_down_failures_only_touch_counters() {
        let mut ledger = Ledger::new();
        ledger.feed(0, true);
        ledger.feed(10, false);
        ledger.feed(200, false);
        let since = ledger.status().status_since;

        ledger.feed(260, false);
        ledger.feed(320, false);
        assert_eq!(ledger.incidents.len(), 1);
        assert_eq!(ledger.status().status_since, since);
        assert_eq!(ledger.status().checks_today, 5);
        assert_eq!(
            ledger.status().last_diagnostic.as_deref(),
            Some("connection refused at 320")
        );
        assert!(ledger.events[3..].iter().all(|e| *e == StatusEvent::None));
    }

    #[test]
    fn test_repeated_outages_never_overlap() {
        let mut ledger = Ledger::new();
        ledger.feed(0, true);
        for cycle in 0..3 {
            let base = 1000 * (cycle + 1);
            ledger.feed(base, false);
            ledger.feed(base + 120, false);
            ledger.feed(base + 180, true);
        }
        assert_eq!(ledger.incidents.len(), 3);
        assert!(ledger.incidents.iter().all(|i| i.duration_seconds == Some(180)));
    }

    #[test]
    fn test_first_check_down_confirms_from_first_failure() {
        let mut ledger = Ledger::new();
        ledger.feed(0, false);
        assert_eq!(ledger.state(), MonitorState::UnconfirmedDown);

        ledger.feed(60, false);
        assert_eq!(ledger.state(), MonitorState::ContestedDown);
        assert_eq!(ledger.snapshot.as_ref().unwrap().pending.as_ref().unwrap().started_at, at(0));

        ledger.feed(120, false);
        assert_eq!(ledger.state(), MonitorState::StableDown);
        assert_eq!(ledger.incidents[0].started_at, at(0));
    }

    #[test]
    fn test_first_check_down_then_up_does_not_notify() {
        let mut ledger = Ledger::new();
        ledger.feed(0, false);
        ledger.feed(30, true);
        assert_eq!(ledger.state(), MonitorState::StableUp);
        assert_eq!(ledger.status().status_since, at(30));
        assert!(ledger.incidents.is_empty());
        assert_eq!(ledger.events[1], StatusEvent::None);
    }

    #[test]
    fn test_first_check_down_streak_then_up_starts_fresh() {
        let mut ledger = Ledger::new();
        ledger.feed(0, false);
        ledger.feed(60, false);
        ledger.feed(90, true);
        assert_eq!(ledger.state(), MonitorState::StableUp);
        assert_eq!(ledger.status().status_since, at(90));
        assert!(ledger.incidents.is_empty());
        assert_eq!(ledger.events[2], StatusEvent::BlipCleared { started_at: at(0) });
        assert!(!ledger.events[2].is_confirmed_transition());
    }

    #[test]
    fn test_uptime_pct() {
        assert_eq!(uptime_pct(0, 0), 100.0);
        assert_eq!(uptime_pct(1, 1), 100.0);
        assert_eq!(uptime_pct(0, 1), 0.0);
        assert_eq!(uptime_pct(1, 3), 100.0 / 3.0);
        assert_eq!(uptime_pct(7, 8), 87.5);

        let mut ledger = Ledger::new();
        let pattern = [true, false, true, true, false, true, true];
        for (i, ok) in pattern.iter().enumerate() {
            ledger.feed(i as i64 * 10, *ok);
        }
        assert_eq!(ledger.status().checks_today, 7);
        assert_eq!(ledger.status().successful_checks_today, 5);
        assert_eq!(ledger.status().today_uptime_pct, 500.0 / 7.0);
    }

    #[test]
    fn test_open_incident_wins_over_stale_pending() {
        let status = plan_transition(None, &check(0, false), window()).status;
        let snapshot = MonitorSnapshot {
            status,
            pending: Some(PendingOutage {
                monitor_id: MONITOR,
                started_at: at(0),
                diagnostic: None,
            }),
            open_incident: Some(Incident {
                id: 3,
                monitor_id: MONITOR,
                started_at: at(0),
                ended_at: None,
                diagnostic: None,
                duration_seconds: None,
            }),
        };
        assert_eq!(snapshot.state(), MonitorState::StableDown);

        let plan = plan_transition(Some(&snapshot), &check(500, false), window());
        assert_eq!(plan.pending, PendingChange::Discard);
        assert_eq!(plan.incident, IncidentChange::None);
    }
}
