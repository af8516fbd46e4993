//! Audit alert hooks
//!
//! Operators are told when audit storage stops accepting writes, when it
//! comes back, and when a job is parked for manual inspection. Notifications
//! are dispatched via `tokio::spawn` so they never block job processing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted when audit persistence health changes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AuditAlertEvent {
    /// Storage has been failing beyond the configured threshold
    StorageUnreachable {
        /// Wall-clock time of the first failure in the current outage
        first_failure_at: DateTime<Utc>,
        consecutive_failures: u64,
        /// How long storage has been unreachable (seconds)
        unreachable_duration_secs: u64,
        /// Error message from the most recent failure
        last_error: String,
        service_name: String,
    },
    /// Storage accepted a write again after an alert
    StorageRecovered {
        outage_started_at: DateTime<Utc>,
        recovered_at: DateTime<Utc>,
        outage_duration_secs: u64,
        /// Jobs that failed during the outage
        jobs_affected: u64,
        service_name: String,
    },
    /// A job exhausted its attempts or failed permanently
    JobParked {
        job_id: Uuid,
        attempts: u32,
        /// Number of drafts the job carried
        drafts: usize,
        last_error: String,
        service_name: String,
    },
}

/// Trait for receiving audit alerts
///
/// Handlers are invoked inside `tokio::spawn` and must handle their own
/// errors (log and continue).
///
/// # Example
///
/// ```rust,ignore
/// use audit_trail::audit::{AuditAlertEvent, AuditAlertHook};
///
/// struct PagerHook;
///
/// #[async_trait]
/// impl AuditAlertHook for PagerHook {
///     async fn on_alert(&self, event: AuditAlertEvent) {
///         if let AuditAlertEvent::JobParked { job_id, .. } = event {
///             // page_on_call(job_id).await;
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait AuditAlertHook: Send + Sync + 'static {
    /// Called when audit persistence health changes
    async fn on_alert(&self, event: AuditAlertEvent);
}

/// Writes alerts to the log at error/warn level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertHook;

#[async_trait]
impl AuditAlertHook for TracingAlertHook {
    async fn on_alert(&self, event: AuditAlertEvent) {
        match event {
            AuditAlertEvent::StorageUnreachable {
                consecutive_failures,
                unreachable_duration_secs,
                last_error,
                service_name,
                ..
            } => tracing::error!(
                alert = true,
                service_name = %service_name,
                consecutive_failures,
                unreachable_duration_secs,
                last_error = %last_error,
                "Audit storage unreachable"
            ),
            AuditAlertEvent::StorageRecovered {
                outage_duration_secs,
                jobs_affected,
                service_name,
                ..
            } => tracing::warn!(
                alert = true,
                service_name = %service_name,
                outage_duration_secs,
                jobs_affected,
                "Audit storage recovered"
            ),
            AuditAlertEvent::JobParked {
                job_id,
                attempts,
                drafts,
                last_error,
                service_name,
            } => tracing::error!(
                alert = true,
                service_name = %service_name,
                job_id = %job_id,
                attempts,
                drafts,
                last_error = %last_error,
                "Audit job parked for inspection"
            ),
        }
    }
}
