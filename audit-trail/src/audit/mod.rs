//! Audit trail pipeline
//!
//! Captures audit-worthy occurrences as typed [`AuditEvent`]s and turns them
//! into append-only, signed [`AuditLogRecord`]s.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! - [`risk`]: pure scoring of an event's sensitivity
//! - [`dedup`]: suppresses duplicate captures of one request
//! - [`signature`]: integrity tokens over a canonical content hash
//! - [`storage`]: durable storage and queries ([`AuditStorage`])
//! - [`service`]: validation and the single write contract ([`AuditService`])
//! - [`emitter`] and [`bus`]: non-blocking publication to topic handlers
//! - [`listener`]: event to draft translation, queue-first writes
//! - [`queue`]: jobs, retry with backoff, parking
//! - [`pipeline`]: wires everything and supervises the background tasks
//!
//! Emission never blocks or fails the caller. Persistence failures surface to
//! the queue processor, which retries them and eventually parks the job for an
//! operator.

pub mod alert;
pub mod bus;
pub mod dedup;
pub mod emitter;
pub mod event;
pub mod failure_tracker;
pub mod listener;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod record;
pub mod risk;
pub mod service;
pub mod signature;
pub mod storage;

pub use alert::{AuditAlertEvent, AuditAlertHook, TracingAlertHook};
pub use bus::{AuditEventBus, AuditEventHandler};
pub use dedup::{DeduplicationEntry, Fingerprint, RequestDeduplicator, RequestKey};
pub use emitter::{AuditEmitter, EmitOptions, EmitterDispatcher};
pub use event::{
    AuditEvent, AuditEventPayload, AuditEventType, RequestContext, SecurityKind, SystemLevel,
};
pub use failure_tracker::FailureTracker;
pub use listener::{draft_from_event, operation_type_for, AuditListener, AuditWriter, WriteOutcome};
pub use pipeline::{AuditPipeline, AuditPipelineBuilder};
pub use query::{AuditLogQuery, Page, SensitiveAccessReport};
pub use queue::{
    AuditJob, JobOptions, JobPayload, JobQueue, JobState, MemoryJobQueue, ProcessorBinding,
    ProcessorRegistry, QueueProcessor, RetryPolicy,
};
pub use record::{AuditLogDraft, AuditLogRecord, OperationType};
pub use risk::{RiskAssessment, RiskLevel};
pub use service::AuditService;
pub use signature::{SignatureRecord, SignatureService, VerificationResult};
pub use storage::{AuditStorage, MemoryAuditStorage};

#[cfg(feature = "database")]
pub use storage::PgAuditStorage;
