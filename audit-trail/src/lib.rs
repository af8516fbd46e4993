//! # audit-trail
//!
//! Tamper-evident audit trail pipeline for services handling personal data.
//! Call sites emit typed audit events; the pipeline scores their risk,
//! suppresses duplicate captures of one request, queues them for persistence
//! with retry and backoff, and signs every stored record so later tampering is
//! detectable.
//!
//! ## Features
//!
//! - **Typed events**: one closed payload variant per event type
//! - **Risk scoring**: deterministic LOW/MEDIUM/HIGH/CRITICAL classification
//! - **Queue-first persistence**: at-least-once jobs with exponential backoff and parking
//! - **Request deduplication**: one write per request across capture points
//! - **Integrity tokens**: BLAKE3 content hash bound into an HS256 token
//! - **Storage**: in-memory, or append-only PostgreSQL with the `database` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use audit_trail::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let pipeline = AuditPipeline::builder(config).start().await?;
//!
//!     let event = AuditEvent::entity_updated(
//!         "Usuario",
//!         "42",
//!         None,
//!         None,
//!         vec!["email".to_string()],
//!     )
//!     .with_user("7")
//!     .with_context(RequestContext::new("PUT", "/api/usuarios/42"));
//!     pipeline.emitter().emit_request(event);
//!
//!     pipeline.drain(std::time::Duration::from_secs(5)).await?;
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod agents;
pub mod audit;
pub mod config;
pub mod error;
pub mod observability;

#[cfg(feature = "database")]
pub mod database;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agents::{BackgroundWorker, TaskStatus};
    pub use crate::audit::{
        AuditAlertEvent, AuditAlertHook, AuditEmitter, AuditEvent, AuditEventBus,
        AuditEventHandler, AuditEventPayload, AuditEventType, AuditJob, AuditLogDraft,
        AuditLogQuery, AuditLogRecord, AuditPipeline, AuditPipelineBuilder, AuditService,
        AuditStorage, AuditWriter, EmitOptions, JobOptions, JobQueue, MemoryAuditStorage,
        MemoryJobQueue, OperationType, Page, RequestContext, RequestDeduplicator, RequestKey,
        RiskLevel, SecurityKind, SensitiveAccessReport, SignatureRecord, SignatureService,
        SystemLevel, VerificationResult,
    };
    pub use crate::config::{
        AlertConfig, Config, DatabaseConfig, DedupConfig, QueueConfig, SigningConfig,
    };
    pub use crate::error::{Error, IntegrityFailure, Result};
    pub use crate::observability::init_tracing;

    #[cfg(feature = "database")]
    pub use crate::audit::PgAuditStorage;
}
