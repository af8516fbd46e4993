//! Audit job queue
//!
//! Jobs carry one draft or a batch of drafts from the write side to the
//! [`QueueProcessor`]. A job moves through
//! `Enqueued -> Processing -> {Completed | Retrying -> Processing | Failed}`;
//! completed jobs are removed, failed jobs stay parked until an operator
//! requeues them.
//!
//! A dequeued job is leased to its worker for the queue's visibility timeout.
//! If the worker never reports back (task aborted, panic, process stall) the
//! lease expires, the lost run counts as a failed attempt, and the job is
//! offered again or parked once its attempts are used up.
//!
//! [`JobQueue`] is the boundary to the queue backend. [`MemoryJobQueue`] is the
//! in-process implementation.

pub mod compress;
pub mod processor;

pub use processor::{ProcessorBinding, ProcessorRegistry, QueueProcessor, RetryPolicy};

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::record::AuditLogDraft;
use super::risk::RiskLevel;
use crate::config::QueueConfig;
use crate::error::{Error, Result};

const LEASE_EXPIRED: &str = "processing lease expired before the job was acknowledged";

/// What a job writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "drafts", rename_all = "snake_case")]
pub enum JobPayload {
    Single(Box<AuditLogDraft>),
    /// Persisted all-or-nothing
    Batch(Vec<AuditLogDraft>),
}

impl JobPayload {
    pub fn drafts(&self) -> &[AuditLogDraft] {
        match self {
            Self::Single(draft) => std::slice::from_ref(draft.as_ref()),
            Self::Batch(drafts) => drafts,
        }
    }

    pub fn drafts_mut(&mut self) -> &mut [AuditLogDraft] {
        match self {
            Self::Single(draft) => std::slice::from_mut(draft.as_mut()),
            Self::Batch(drafts) => drafts,
        }
    }

    /// Highest risk level among the drafts
    pub fn priority(&self) -> RiskLevel {
        self.drafts()
            .iter()
            .map(AuditLogDraft::risk)
            .max()
            .unwrap_or_default()
    }
}

/// Per-job processing flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Compress data snapshots before persisting
    #[serde(default)]
    pub compress: bool,
    /// Sign records after persisting
    #[serde(default)]
    pub sign: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Enqueued,
    Processing,
    Retrying,
    Completed,
    /// Parked after exhausting its attempts or failing permanently
    Failed,
}

/// A unit of queued audit work
#[derive(Debug, Clone)]
pub struct AuditJob {
    pub id: Uuid,
    pub payload: JobPayload,
    pub options: JobOptions,
    /// Failed attempts so far
    pub attempts: u32,
    pub priority: RiskLevel,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    /// Not dequeued before this instant
    pub available_at: Instant,
    /// End of the current processing lease
    pub lease_expires_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl AuditJob {
    fn with_payload(payload: JobPayload, options: JobOptions) -> Self {
        Self {
            id: Uuid::now_v7(),
            priority: payload.priority(),
            payload,
            options,
            attempts: 0,
            state: JobState::Enqueued,
            enqueued_at: Utc::now(),
            available_at: Instant::now(),
            lease_expires_at: None,
            last_error: None,
        }
    }

    pub fn single(draft: AuditLogDraft, options: JobOptions) -> Self {
        Self::with_payload(JobPayload::Single(Box::new(draft)), options)
    }

    pub fn batch(drafts: Vec<AuditLogDraft>, options: JobOptions) -> Self {
        Self::with_payload(JobPayload::Batch(drafts), options)
    }

    /// Chunk drafts into batch jobs of at most `max_batch_size`
    pub fn split_batch(
        drafts: Vec<AuditLogDraft>,
        max_batch_size: usize,
        options: JobOptions,
    ) -> Vec<Self> {
        let size = max_batch_size.max(1);
        let mut jobs = Vec::with_capacity(drafts.len().div_ceil(size));
        let mut drafts = drafts.into_iter().peekable();
        while drafts.peek().is_some() {
            let chunk: Vec<AuditLogDraft> = drafts.by_ref().take(size).collect();
            jobs.push(Self::batch(chunk, options));
        }
        jobs
    }

    pub fn draft_count(&self) -> usize {
        self.payload.drafts().len()
    }
}

/// Queue backend used by the processor
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job; fails with [`Error::Queue`] when the queue refuses it
    async fn enqueue(&self, job: AuditJob) -> Result<Uuid>;

    /// Take the highest priority available job (FIFO within a priority)
    /// and mark it `Processing`
    ///
    /// Jobs whose processing lease has expired are reclaimed first.
    async fn dequeue(&self) -> Result<Option<AuditJob>>;

    /// Acknowledge a processed job and remove it
    async fn complete(&self, id: Uuid) -> Result<()>;

    /// Record a failed attempt and make the job available again after `delay`
    ///
    /// Returns the new attempt count.
    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<u32>;

    /// Record a final failed attempt and park the job
    async fn park(&self, id: Uuid, error: &str) -> Result<()>;

    /// Parked jobs, oldest first
    async fn failed_jobs(&self) -> Result<Vec<AuditJob>>;

    /// Put a parked job back in the queue with a fresh attempt budget
    async fn requeue_failed(&self, id: Uuid) -> Result<()>;

    /// Jobs not yet completed or parked
    async fn pending_count(&self) -> Result<usize>;
}

struct QueuedJob {
    job: AuditJob,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, QueuedJob>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.jobs
            .values()
            .filter(|q| q.job.state != JobState::Failed)
            .count()
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut AuditJob> {
        self.jobs
            .get_mut(&id)
            .map(|q| &mut q.job)
            .ok_or_else(|| Error::NotFound(format!("audit job {}", id)))
    }

    /// Charge an attempt to every job whose lease ran out, then retry or park it
    fn reclaim_expired(&mut self, now: Instant, max_attempts: u32) {
        for queued in self.jobs.values_mut() {
            let job = &mut queued.job;
            let expired = job.state == JobState::Processing
                && job.lease_expires_at.is_some_and(|at| at <= now);
            if !expired {
                continue;
            }

            job.attempts += 1;
            job.lease_expires_at = None;
            job.last_error = Some(LEASE_EXPIRED.to_string());
            if job.attempts >= max_attempts {
                job.state = JobState::Failed;
                tracing::error!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    "Audit job lease expired with no attempts left, parked"
                );
            } else {
                job.state = JobState::Retrying;
                job.available_at = now;
                tracing::warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    "Audit job lease expired, offering it again"
                );
            }
        }
    }
}

/// In-process job queue
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    /// Maximum pending jobs; `None` for unbounded
    capacity: Option<usize>,
    visibility_timeout: Duration,
    max_attempts: u32,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl std::fmt::Debug for MemoryJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryJobQueue")
            .field("jobs", &state.jobs.len())
            .field("capacity", &self.capacity)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("closed", &state.closed)
            .finish()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease length and attempt budget taken from queue configuration
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::default(),
            capacity: None,
            visibility_timeout: config.visibility_timeout(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Queue that refuses jobs once `capacity` are pending
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Lease dequeued jobs for `timeout`; a job whose lease expires
    /// `max_attempts` times is parked
    pub fn with_visibility_timeout(mut self, timeout: Duration, max_attempts: u32) -> Self {
        self.visibility_timeout = timeout;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Refuse further jobs; queued ones can still be processed
    pub fn close(&self) {
        self.lock().closed = true;
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of a job
    pub fn job(&self, id: Uuid) -> Option<AuditJob> {
        self.lock().jobs.get(&id).map(|q| q.job.clone())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, mut job: AuditJob) -> Result<Uuid> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Queue("audit queue is closed".into()));
        }
        if self.capacity.is_some_and(|cap| state.pending() >= cap) {
            return Err(Error::Queue("audit queue is full".into()));
        }

        job.state = JobState::Enqueued;
        let id = job.id;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(id, QueuedJob { job, seq });
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<AuditJob>> {
        let mut state = self.lock();
        let now = Instant::now();
        state.reclaim_expired(now, self.max_attempts);

        let next = state
            .jobs
            .values()
            .filter(|q| {
                matches!(q.job.state, JobState::Enqueued | JobState::Retrying)
                    && q.job.available_at <= now
            })
            .max_by(|a, b| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|q| q.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = state.get_mut(id)?;
        job.state = JobState::Processing;
        job.lease_expires_at = Some(now + self.visibility_timeout);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        self.lock()
            .jobs
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("audit job {}", id)))
    }

    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<u32> {
        let mut state = self.lock();
        let job = state.get_mut(id)?;
        job.attempts += 1;
        job.state = JobState::Retrying;
        job.lease_expires_at = None;
        job.available_at = Instant::now() + delay;
        job.last_error = Some(error.to_string());
        Ok(job.attempts)
    }

    async fn park(&self, id: Uuid, error: &str) -> Result<()> {
        let mut state = self.lock();
        let job = state.get_mut(id)?;
        job.attempts += 1;
        job.state = JobState::Failed;
        job.lease_expires_at = None;
        job.last_error = Some(error.to_string());
        Ok(())
    }

    async fn failed_jobs(&self) -> Result<Vec<AuditJob>> {
        let state = self.lock();
        let mut failed: Vec<&QueuedJob> = state
            .jobs
            .values()
            .filter(|q| q.job.state == JobState::Failed)
            .collect();
        failed.sort_by_key(|q| q.seq);
        Ok(failed.into_iter().map(|q| q.job.clone()).collect())
    }

    async fn requeue_failed(&self, id: Uuid) -> Result<()> {
        let mut state = self.lock();
        let job = state.get_mut(id)?;
        if job.state != JobState::Failed {
            return Err(Error::Queue(format!("audit job {} is not parked", id)));
        }
        job.state = JobState::Enqueued;
        job.attempts = 0;
        job.lease_expires_at = None;
        job.available_at = Instant::now();
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.lock().pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::record::OperationType;

    fn draft(risk: RiskLevel) -> AuditLogDraft {
        AuditLogDraft::new(OperationType::Update, "Beneficio").with_risk_level(risk)
    }

    #[test]
    fn test_split_batch_respects_max_size() {
        let drafts: Vec<_> = (0..250).map(|_| draft(RiskLevel::Low)).collect();
        let jobs = AuditJob::split_batch(drafts, 100, JobOptions::default());
        let sizes: Vec<usize> = jobs.iter().map(AuditJob::draft_count).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        assert!(AuditJob::split_batch(Vec::new(), 100, JobOptions::default()).is_empty());
    }

    #[test]
    fn test_priority_is_highest_draft_risk() {
        let job = AuditJob::batch(
            vec![draft(RiskLevel::Low), draft(RiskLevel::High), draft(RiskLevel::Medium)],
            JobOptions::default(),
        );
        assert_eq!(job.priority, RiskLevel::High);
        assert_eq!(AuditJob::batch(Vec::new(), JobOptions::default()).priority, RiskLevel::Low);
    }

    #[tokio::test]
    async fn test_dequeue_orders_by_priority_then_fifo() {
        let queue = MemoryJobQueue::new();
        let low_a = queue
            .enqueue(AuditJob::single(draft(RiskLevel::Low), JobOptions::default()))
            .await
            .unwrap();
        let critical = queue
            .enqueue(AuditJob::single(draft(RiskLevel::Critical), JobOptions::default()))
            .await
            .unwrap();
        let low_b = queue
            .enqueue(AuditJob::single(draft(RiskLevel::Low), JobOptions::default()))
            .await
            .unwrap();

        let order: Vec<Uuid> = [
            queue.dequeue().await.unwrap().unwrap(),
            queue.dequeue().await.unwrap().unwrap(),
            queue.dequeue().await.unwrap().unwrap(),
        ]
        .iter()
        .map(|job| {
            assert_eq!(job.state, JobState::Processing);
            job.id
        })
        .collect();
        assert_eq!(order, vec![critical, low_a, low_b]);
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.pending_count().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delays_availability() {
        let queue = MemoryJobQueue::new();
        let id = queue
            .enqueue(AuditJob::single(draft(RiskLevel::Low), JobOptions::default()))
            .await
            .unwrap();
        queue.dequeue().await.unwrap();

        let attempts = queue
            .retry(id, Duration::from_secs(2), "connection reset")
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        assert!(queue.dequeue().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.last_error.as_deref(), Some("connection reset"));

        queue.complete(id).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert!(matches!(queue.complete(id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_parked_jobs_are_not_dequeued_until_requeued() {
        let queue = MemoryJobQueue::new();
        let id = queue
            .enqueue(AuditJob::single(draft(RiskLevel::Low), JobOptions::default()))
            .await
            .unwrap();
        queue.dequeue().await.unwrap();
        queue.park(id, "validation failed").await.unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        let failed = queue.failed_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 1);
        assert_eq!(failed[0].state, JobState::Failed);

        queue.requeue_failed(id).await.unwrap();
        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert!(queue.requeue_failed(id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_job_is_reclaimed_then_parked() {
        let queue = MemoryJobQueue::new().with_visibility_timeout(Duration::from_secs(30), 2);
        let id = queue
            .enqueue(AuditJob::single(draft(RiskLevel::Low), JobOptions::default()))
            .await
            .unwrap();

        // Worker takes the job and never reports back
        let job = queue.dequeue().await.unwrap().unwrap();
        assert!(job.lease_expires_at.is_some());
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(queue.dequeue().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED));

        // Abandoned again: out of attempts
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        let failed = queue.failed_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!((failed[0].state, failed[0].attempts), (JobState::Failed, 2));
    }

    #[tokio::test]
    async fn test_bounded_and_closed_queues_refuse_jobs() {
        let queue = MemoryJobQueue::bounded(1);
        queue
            .enqueue(AuditJob::single(draft(RiskLevel::Low), JobOptions::default()))
            .await
            .unwrap();
        let err = queue
            .enqueue(AuditJob::single(draft(RiskLevel::Low), JobOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Queue(_)));

        let queue = MemoryJobQueue::new();
        queue.close();
        assert!(queue
            .enqueue(AuditJob::single(draft(RiskLevel::Low), JobOptions::default()))
            .await
            .is_err());
    }
}
