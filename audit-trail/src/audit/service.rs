//! Audit core service
//!
//! The single write contract for audit logs. Every path (queue worker or
//! direct fallback) ends here: drafts are validated, given a UUID v7 and a
//! strictly increasing `created_at`, then appended through [`AuditStorage`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::query::{AuditLogQuery, Page, SensitiveAccessReport, MAX_PAGE_SIZE};
use super::record::{AuditLogDraft, AuditLogRecord};
use super::signature::{SignatureRecord, SignatureService};
use super::storage::AuditStorage;
use crate::error::{Error, IntegrityFailure, Result};

/// Creates and reads audit logs
pub struct AuditService {
    storage: Arc<dyn AuditStorage>,
    signer: Option<Arc<SignatureService>>,
    /// Last `created_at` handed out, in microseconds since the epoch
    last_created_micros: AtomicI64,
}

impl std::fmt::Debug for AuditService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditService")
            .field("signing", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl AuditService {
    pub fn new(storage: Arc<dyn AuditStorage>) -> Self {
        Self {
            storage,
            signer: None,
            last_created_micros: AtomicI64::new(0),
        }
    }

    /// Enable signing and verification
    pub fn with_signer(mut self, signer: Arc<SignatureService>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn storage(&self) -> &Arc<dyn AuditStorage> {
        &self.storage
    }

    pub fn signer(&self) -> Option<&Arc<SignatureService>> {
        self.signer.as_ref()
    }

    /// Next insertion timestamp: the clock, or 1µs past the previous one
    fn next_created_at(&self) -> Result<DateTime<Utc>> {
        let now = Utc::now().timestamp_micros();
        let mut last = self.last_created_micros.load(Ordering::Acquire);
        let micros = loop {
            let candidate = now.max(last + 1);
            match self.last_created_micros.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break candidate,
                Err(actual) => last = actual,
            }
        };
        DateTime::<Utc>::from_timestamp_micros(micros)
            .ok_or_else(|| Error::Internal(format!("timestamp out of range: {}µs", micros)))
    }

    /// Validate and persist one draft
    pub async fn create_audit_log(&self, draft: AuditLogDraft) -> Result<AuditLogRecord> {
        draft.validate(Utc::now())?;
        let record = draft.into_record(Uuid::now_v7(), self.next_created_at()?)?;

        self.storage.append(&record).await?;

        tracing::debug!(
            log_id = %record.id,
            operation = %record.operation_type,
            entity = %record.affected_entity,
            "Audit log created"
        );
        Ok(record)
    }

    /// Validate every draft, then persist all of them or none
    ///
    /// The first invalid draft fails the whole batch; the error names its index.
    pub async fn create_audit_logs_batch(
        &self,
        drafts: Vec<AuditLogDraft>,
    ) -> Result<Vec<AuditLogRecord>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        for (index, draft) in drafts.iter().enumerate() {
            draft.validate(now).map_err(|e| match e {
                Error::Validation(msg) => {
                    Error::Validation(format!("batch entry {}: {}", index, msg))
                }
                other => other,
            })?;
        }

        let mut records = Vec::with_capacity(drafts.len());
        for draft in drafts {
            records.push(draft.into_record(Uuid::now_v7(), self.next_created_at()?)?);
        }

        self.storage.append_batch(&records).await?;

        tracing::debug!(count = records.len(), "Audit log batch created");
        Ok(records)
    }

    /// Sign persisted records and store their signatures
    pub async fn sign_records(&self, records: &[AuditLogRecord]) -> Result<Vec<SignatureRecord>> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            Error::Configuration("audit signing requested but no signing key is configured".into())
        })?;
        let signatures = signer.sign_batch(records)?;
        self.storage.store_signatures(&signatures).await?;
        Ok(signatures)
    }

    /// Check a stored record against its stored signature
    pub async fn verify_log(&self, id: Uuid) -> Result<()> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            Error::Configuration("audit verification requires a signing key".into())
        })?;
        let record = self
            .storage
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("audit log {}", id)))?;
        let signature = self
            .storage
            .signature_for(id)
            .await?
            .ok_or_else(|| Error::integrity(id, IntegrityFailure::MissingSignature))?;

        signer.check(&record, &signature.token)
    }

    /// Paged, filtered search, newest first
    pub async fn find_by_filters(&self, query: &AuditLogQuery) -> Result<Page<AuditLogRecord>> {
        if let (Some(from), Some(to)) = (query.created_from, query.created_to) {
            if from > to {
                return Err(Error::validation("created_from is after created_to"));
            }
        }
        self.storage.find(query).await
    }

    /// History of one entity (or every instance when `entity_id` is `None`)
    pub async fn find_by_entity(
        &self,
        entity: &str,
        entity_id: Option<&str>,
        page: u32,
    ) -> Result<Page<AuditLogRecord>> {
        let query = AuditLogQuery::new()
            .entity(entity, entity_id.map(str::to_string))
            .page(page, MAX_PAGE_SIZE);
        self.storage.find(&query).await
    }

    /// Everything a user did
    pub async fn find_by_user(&self, user_id: &str, page: u32) -> Result<Page<AuditLogRecord>> {
        let query = AuditLogQuery::new().user(user_id).page(page, MAX_PAGE_SIZE);
        self.storage.find(&query).await
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<AuditLogRecord>> {
        self.storage.find_by_id(id).await
    }

    /// Who touched which personal data fields in `[from, to]`
    pub async fn sensitive_access_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SensitiveAccessReport> {
        if from > to {
            return Err(Error::validation("report window starts after it ends"));
        }
        self.storage.sensitive_access_report(from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::record::OperationType;
    use crate::audit::signature::tests::signing_config;
    use crate::audit::storage::testing::FlakyStorage;
    use crate::audit::storage::MemoryAuditStorage;
    use chrono::Duration;

    fn service() -> (AuditService, Arc<MemoryAuditStorage>) {
        let storage = Arc::new(MemoryAuditStorage::new());
        let signer = Arc::new(SignatureService::new(&signing_config()).unwrap());
        (AuditService::new(storage.clone()).with_signer(signer), storage)
    }

    fn draft(entity: &str) -> AuditLogDraft {
        AuditLogDraft::new(OperationType::Update, entity).with_entity_id("42")
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_monotonic_created_at() {
        let (service, storage) = service();
        let mut previous: Option<AuditLogRecord> = None;
        for _ in 0..50 {
            let record = service.create_audit_log(draft("Usuario")).await.unwrap();
            if let Some(prev) = &previous {
                assert!(record.created_at > prev.created_at);
                assert_ne!(record.id, prev.id);
            }
            previous = Some(record);
        }
        assert_eq!(storage.len().await, 50);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_draft() {
        let (service, storage) = service();
        let err = service
            .create_audit_log(AuditLogDraft::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_batch_with_invalid_last_draft_persists_nothing() {
        let (service, storage) = service();
        let mut drafts: Vec<AuditLogDraft> = (0..9).map(|_| draft("Beneficio")).collect();
        drafts.push(AuditLogDraft::new(OperationType::Create, ""));

        let err = service.create_audit_logs_batch(drafts).await.unwrap_err();
        match err {
            Error::Validation(msg) => assert!(msg.starts_with("batch entry 9")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(storage.is_empty().await);

        let drafts: Vec<AuditLogDraft> = (0..10).map(|_| draft("Beneficio")).collect();
        let records = service.create_audit_logs_batch(drafts).await.unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(storage.len().await, 10);
    }

    #[tokio::test]
    async fn test_storage_failure_is_surfaced() {
        let storage = FlakyStorage::new();
        storage.fail_next(1);
        let service = AuditService::new(storage.clone());

        let err = service.create_audit_log(draft("Usuario")).await.unwrap_err();
        assert!(err.is_retriable());
        assert!(service.create_audit_log(draft("Usuario")).await.is_ok());
    }

    #[tokio::test]
    async fn test_finders() {
        let (service, _) = service();
        service
            .create_audit_log(draft("Usuario").with_user("7"))
            .await
            .unwrap();
        service
            .create_audit_log(
                AuditLogDraft::new(OperationType::Read, "Beneficio")
                    .with_entity_id("1")
                    .with_user("8"),
            )
            .await
            .unwrap();

        let by_entity = service.find_by_entity("Usuario", Some("42"), 1).await.unwrap();
        assert_eq!(by_entity.total, 1);
        let by_user = service.find_by_user("8", 1).await.unwrap();
        assert_eq!(by_user.items[0].affected_entity, "Beneficio");

        let id = by_user.items[0].id;
        assert_eq!(service.find_by_id(id).await.unwrap().unwrap().id, id);

        let all = service.find_by_filters(&AuditLogQuery::new()).await.unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.items[0].affected_entity, "Beneficio");
    }

    #[tokio::test]
    async fn test_sensitive_access_report_counts_anonymous() {
        let (service, _) = service();
        let start = Utc::now() - Duration::seconds(1);
        service
            .create_audit_log(
                AuditLogDraft::new(OperationType::Access, "Usuario")
                    .with_sensitive_fields(vec!["cpf".to_string()]),
            )
            .await
            .unwrap();

        let report = service
            .sensitive_access_report(start, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.by_user.get("anonymous"), Some(&1));

        assert!(service
            .sensitive_access_report(Utc::now(), start)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_sign_and_verify_roundtrip_through_storage() {
        let (service, _) = service();
        let record = service.create_audit_log(draft("Usuario")).await.unwrap();

        let err = service.verify_log(record.id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::IntegrityViolation {
                reason: IntegrityFailure::MissingSignature,
                ..
            }
        ));

        service.sign_records(std::slice::from_ref(&record)).await.unwrap();
        service.verify_log(record.id).await.unwrap();

        assert!(matches!(
            service.verify_log(Uuid::now_v7()).await,
            Err(Error::NotFound(_))
        ));
    }
}
