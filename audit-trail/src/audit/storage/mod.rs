//! Audit log storage trait and backend implementations
//!
//! The `AuditStorage` trait is the minimal read/write contract the core service
//! needs. Records are append-only: there is no update or delete operation, and
//! the PostgreSQL backend enforces that at the database level as well.
//!
//! # Available Backends
//!
//! - **Memory** (always available): process-local, for tests and single-node tools
//! - **PostgreSQL** (`database` feature): `CREATE RULE` discards UPDATE/DELETE

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::query::{AuditLogQuery, Page, SensitiveAccessReport};
use super::record::AuditLogRecord;
use super::signature::SignatureRecord;
use crate::error::Error;

pub mod memory;

#[cfg(feature = "database")]
pub mod pg;

pub use memory::MemoryAuditStorage;

#[cfg(feature = "database")]
pub use pg::PgAuditStorage;

/// Trait for audit log persistence backends
///
/// Failures that may succeed on retry must be reported as
/// [`Error::TransientStorage`] so the queue processor backs off and retries.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Append one record
    async fn append(&self, record: &AuditLogRecord) -> Result<(), Error>;

    /// Append many records, all or nothing
    async fn append_batch(&self, records: &[AuditLogRecord]) -> Result<(), Error>;

    /// Records matching the query, newest first, one page at a time
    async fn find(&self, query: &AuditLogQuery) -> Result<Page<AuditLogRecord>, Error>;

    /// Record by id
    async fn find_by_id(&self, id: Uuid) -> Result<Option<AuditLogRecord>, Error>;

    /// Sensitive field access tallies for records created in `[from, to]`
    async fn sensitive_access_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SensitiveAccessReport, Error>;

    /// Persist integrity signatures
    async fn store_signatures(&self, signatures: &[SignatureRecord]) -> Result<(), Error>;

    /// Signature stored for a record
    async fn signature_for(&self, log_id: Uuid) -> Result<Option<SignatureRecord>, Error>;
}
