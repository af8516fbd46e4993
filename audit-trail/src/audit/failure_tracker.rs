//! Audit storage failure tracking
//!
//! Counts consecutive storage failures seen by the queue processor and
//! dispatches alert hooks once an outage outlasts the configured threshold.
//! A recovery event follows the first successful write after an alert.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::alert::{AuditAlertEvent, AuditAlertHook};
use crate::config::AlertConfig;

/// Outage state, guarded by a `std::sync::Mutex` never held across `.await`
#[derive(Default)]
struct TrackerState {
    /// Monotonic start of the current outage
    first_failure_at: Option<Instant>,
    /// Wall-clock start of the current outage (for alert payloads)
    first_failure_wall: Option<DateTime<Utc>>,
    consecutive_failures: u64,
    last_error: String,
    /// When the last alert went out (for cooldown)
    last_alert_at: Option<Instant>,
    alert_active: bool,
}

/// Tracks audit storage failures and dispatches alert hooks
pub struct FailureTracker {
    state: Mutex<TrackerState>,
    hooks: Vec<Arc<dyn AuditAlertHook>>,
    threshold: Duration,
    cooldown: Duration,
    notify_recovery: bool,
    service_name: String,
}

impl std::fmt::Debug for FailureTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureTracker")
            .field("hooks", &self.hooks.len())
            .field("threshold", &self.threshold)
            .field("cooldown", &self.cooldown)
            .field("service_name", &self.service_name)
            .finish()
    }
}

impl FailureTracker {
    /// Create a tracker
    ///
    /// * `threshold`: continuous failure time before alerting
    /// * `cooldown`: minimum time between repeated alerts
    pub fn new(
        hooks: Vec<Arc<dyn AuditAlertHook>>,
        threshold: Duration,
        cooldown: Duration,
        notify_recovery: bool,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            hooks,
            threshold,
            cooldown,
            notify_recovery,
            service_name: service_name.into(),
        }
    }

    pub fn from_config(
        hooks: Vec<Arc<dyn AuditAlertHook>>,
        config: &AlertConfig,
        service_name: impl Into<String>,
    ) -> Self {
        Self::new(
            hooks,
            Duration::from_secs(config.threshold_secs),
            Duration::from_secs(config.cooldown_secs),
            config.notify_recovery,
            service_name,
        )
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of failures in the current outage
    pub fn consecutive_failures(&self) -> u64 {
        self.lock().consecutive_failures
    }

    /// Record a storage failure, alerting past the threshold and cooldown
    pub fn record_failure(&self, error: &str) {
        let alert = {
            let mut state = self.lock();
            let now = Instant::now();

            let started = *state.first_failure_at.get_or_insert(now);
            let started_wall = *state.first_failure_wall.get_or_insert_with(Utc::now);
            state.consecutive_failures += 1;
            state.last_error = error.to_string();

            let elapsed = now.duration_since(started);
            let cooldown_ok = state
                .last_alert_at
                .is_none_or(|last| now.duration_since(last) >= self.cooldown);

            if elapsed >= self.threshold && cooldown_ok {
                state.last_alert_at = Some(now);
                state.alert_active = true;
                Some(AuditAlertEvent::StorageUnreachable {
                    first_failure_at: started_wall,
                    consecutive_failures: state.consecutive_failures,
                    unreachable_duration_secs: elapsed.as_secs(),
                    last_error: state.last_error.clone(),
                    service_name: self.service_name.clone(),
                })
            } else {
                None
            }
        }; // lock dropped here

        if let Some(event) = alert {
            self.notify(event);
        }
    }

    /// Record a successful write, ending any outage
    pub fn record_success(&self) {
        let recovery = {
            let mut state = self.lock();
            if state.consecutive_failures == 0 {
                return;
            }

            let event = match (state.alert_active && self.notify_recovery, state.first_failure_wall) {
                (true, Some(started)) => {
                    let now = Utc::now();
                    Some(AuditAlertEvent::StorageRecovered {
                        outage_started_at: started,
                        recovered_at: now,
                        outage_duration_secs: (now - started).num_seconds().max(0) as u64,
                        jobs_affected: state.consecutive_failures,
                        service_name: self.service_name.clone(),
                    })
                }
                _ => None,
            };

            let last_alert_at = state.last_alert_at;
            *state = TrackerState {
                last_alert_at,
                ..TrackerState::default()
            };
            event
        }; // lock dropped here

        if let Some(event) = recovery {
            self.notify(event);
        }
    }

    /// Dispatch an event to every hook via `tokio::spawn`
    pub fn notify(&self, event: AuditAlertEvent) {
        for hook in &self.hooks {
            let hook = Arc::clone(hook);
            let event = event.clone();
            tokio::spawn(async move {
                hook.on_alert(event).await;
            });
        }
    }
}
