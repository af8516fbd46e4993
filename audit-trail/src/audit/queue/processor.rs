//! Queue processor
//!
//! Worker loops take jobs from a [`JobQueue`] and persist them through
//! [`AuditService`]. Failures that storage may recover from are retried with
//! exponential backoff; anything else, or a job out of attempts, is parked.
//!
//! A processor is bound to a name through a [`ProcessorRegistry`]. The
//! registry is owned by whoever bootstraps the pipeline and hands out one
//! [`ProcessorBinding`] per name, so two processors can never consume the same
//! queue under one name in a process.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::compress::compress_draft;
use super::{AuditJob, JobPayload, JobQueue};
use crate::audit::alert::AuditAlertEvent;
use crate::audit::failure_tracker::FailureTracker;
use crate::audit::record::AuditLogRecord;
use crate::audit::service::AuditService;
use crate::config::QueueConfig;
use crate::error::{Error, Result};

/// Exponential backoff for failed jobs
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before a job is parked
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.delay_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before retrying a job that has failed `attempts` times
    ///
    /// `base * multiplier^(attempts-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let exponent = f64::from(attempts - 1);
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powf(exponent);

        // Large exponents overflow to infinity
        if delay.is_finite() && delay < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(delay)
        } else {
            self.max_delay
        }
    }
}

/// Names bound to a running processor
#[derive(Debug, Clone, Default)]
pub struct ProcessorRegistry {
    bound: Arc<Mutex<HashSet<String>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a processor name
    ///
    /// Fails with [`Error::AlreadyRegistered`] while another binding holds it.
    pub fn bind(&self, name: impl Into<String>) -> Result<ProcessorBinding> {
        let name = name.into();
        let mut bound = self.bound.lock().unwrap_or_else(|e| e.into_inner());
        if !bound.insert(name.clone()) {
            return Err(Error::AlreadyRegistered(format!("queue processor '{}'", name)));
        }
        Ok(ProcessorBinding {
            name,
            registry: self.clone(),
        })
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    fn release(&self, name: &str) {
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }
}

/// Exclusive claim on a processor name, released on drop
#[derive(Debug)]
pub struct ProcessorBinding {
    name: String,
    registry: ProcessorRegistry,
}

impl ProcessorBinding {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ProcessorBinding {
    fn drop(&mut self) {
        self.registry.release(&self.name);
        tracing::debug!(processor = %self.name, "Queue processor name released");
    }
}

/// Persists queued audit jobs
pub struct QueueProcessor {
    binding: ProcessorBinding,
    queue: Arc<dyn JobQueue>,
    service: Arc<AuditService>,
    policy: RetryPolicy,
    tracker: Option<Arc<FailureTracker>>,
}

impl std::fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("name", &self.binding.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl QueueProcessor {
    pub fn new(
        binding: ProcessorBinding,
        queue: Arc<dyn JobQueue>,
        service: Arc<AuditService>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            binding,
            queue,
            service,
            policy,
            tracker: None,
        }
    }

    /// Report storage outages and parked jobs through a failure tracker
    pub fn with_failure_tracker(mut self, tracker: Arc<FailureTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn name(&self) -> &str {
        self.binding.name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Process one available job
    ///
    /// Returns `Ok(false)` when no job was available. Job failures are handled
    /// here (retry or park); only queue errors are returned.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(mut job) = self.queue.dequeue().await? else {
            return Ok(false);
        };

        match self.execute(&mut job).await {
            Ok(records) => {
                self.queue.complete(job.id).await?;
                if let Some(tracker) = &self.tracker {
                    tracker.record_success();
                }
                tracing::debug!(
                    processor = %self.name(),
                    job_id = %job.id,
                    records = records.len(),
                    attempts = job.attempts + 1,
                    "Audit job completed"
                );
            }
            Err(e) => self.handle_failure(&job, e).await?,
        }
        Ok(true)
    }

    /// Compress, persist, then sign
    async fn execute(&self, job: &mut AuditJob) -> Result<Vec<AuditLogRecord>> {
        if job.options.compress {
            for draft in job.payload.drafts_mut() {
                compress_draft(draft)?;
            }
        }

        let records = match &job.payload {
            JobPayload::Single(draft) => {
                vec![self.service.create_audit_log(draft.as_ref().clone()).await?]
            }
            JobPayload::Batch(drafts) => {
                self.service.create_audit_logs_batch(drafts.clone()).await?
            }
        };

        // Records are already durable; retrying would write them twice
        if job.options.sign && !records.is_empty() {
            if let Err(e) = self.service.sign_records(&records).await {
                tracing::warn!(
                    processor = %self.name(),
                    job_id = %job.id,
                    records = records.len(),
                    error = %e,
                    "Audit records persisted but not signed"
                );
            }
        }

        Ok(records)
    }

    async fn handle_failure(&self, job: &AuditJob, error: Error) -> Result<()> {
        let message = error.to_string();

        if error.is_retriable() {
            if let Some(tracker) = &self.tracker {
                tracker.record_failure(&message);
            }

            let attempts = job.attempts + 1;
            if attempts < self.policy.max_attempts {
                let delay = self.policy.delay_for(attempts);
                self.queue.retry(job.id, delay, &message).await?;
                tracing::warn!(
                    processor = %self.name(),
                    job_id = %job.id,
                    attempts,
                    max_attempts = self.policy.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %message,
                    "Audit job failed, retrying"
                );
                return Ok(());
            }
        }

        self.queue.park(job.id, &message).await?;
        let attempts = job.attempts + 1;
        tracing::error!(
            processor = %self.name(),
            job_id = %job.id,
            attempts,
            drafts = job.draft_count(),
            retriable = error.is_retriable(),
            error = %message,
            "Audit job parked"
        );

        if let Some(tracker) = &self.tracker {
            tracker.notify(AuditAlertEvent::JobParked {
                job_id: job.id,
                attempts,
                drafts: job.draft_count(),
                last_error: message,
                service_name: tracker.service_name().to_string(),
            });
        }
        Ok(())
    }

    /// Worker loop: drain available jobs, then poll every `poll_interval`
    ///
    /// Runs until the surrounding task is cancelled.
    pub async fn run_worker(
        self: Arc<Self>,
        worker_id: usize,
        poll_interval: Duration,
    ) -> anyhow::Result<()> {
        tracing::info!(processor = %self.name(), worker_id, "Audit queue worker started");
        loop {
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        processor = %self.name(),
                        worker_id,
                        error = %e,
                        "Audit queue unavailable"
                    );
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
