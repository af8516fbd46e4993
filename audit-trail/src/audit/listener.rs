//! Event listeners
//!
//! Turn published [`AuditEvent`]s into [`AuditLogDraft`]s and hand them to the
//! [`AuditWriter`]. The writer is queue-first: drafts become [`AuditJob`]s and
//! are persisted by the queue processor. Only when no queue is configured, or
//! the queue refuses the job, does the writer call [`AuditService`] directly.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::bus::{AuditEventBus, AuditEventHandler};
use super::event::{AuditEvent, AuditEventPayload, AuditEventType};
use super::queue::{AuditJob, JobOptions, JobQueue};
use super::record::{AuditLogDraft, AuditLogRecord, OperationType};
use super::risk::{self, RiskLevel};
use super::service::AuditService;
use crate::error::Result;

/// Operation recorded for an event type
pub fn operation_type_for(event_type: AuditEventType) -> OperationType {
    match event_type {
        AuditEventType::EntityCreated => OperationType::Create,
        AuditEventType::EntityUpdated => OperationType::Update,
        AuditEventType::EntityDeleted => OperationType::Delete,
        AuditEventType::EntityAccessed => OperationType::Read,
        AuditEventType::SensitiveDataAccessed => OperationType::Access,
        AuditEventType::SensitiveDataExported => OperationType::Export,
        AuditEventType::Login => OperationType::Login,
        AuditEventType::Logout => OperationType::Logout,
        AuditEventType::FailedLogin => OperationType::FailedLogin,
        AuditEventType::SecurityAlert
        | AuditEventType::SecurityViolation
        | AuditEventType::UnauthorizedAccess
        | AuditEventType::SystemInfo
        | AuditEventType::SystemWarning
        | AuditEventType::SystemError => OperationType::Access,
    }
}

/// Risk recorded for an event
///
/// An explicitly set level wins. Updates are classified by the fields they
/// changed; other events keep their scored level.
fn risk_for(event: &AuditEvent) -> RiskLevel {
    if event.risk_is_pinned() {
        return event.risk_level;
    }
    match &event.payload {
        AuditEventPayload::EntityUpdated(change) => {
            risk::classify_changed_fields(change.changed_fields.as_slice())
        }
        _ => event.risk_level,
    }
}

/// Build the persistence command for an event
pub fn draft_from_event(event: &AuditEvent) -> AuditLogDraft {
    let event_type = event.event_type();
    let mut draft = AuditLogDraft {
        operation_type: Some(operation_type_for(event_type)),
        user_id: event.user_id.clone(),
        risk_level: Some(risk_for(event)),
        occurred_at: Some(event.timestamp),
        ..AuditLogDraft::default()
    };

    match &event.payload {
        AuditEventPayload::EntityCreated(change)
        | AuditEventPayload::EntityUpdated(change)
        | AuditEventPayload::EntityDeleted(change) => {
            draft.affected_entity = change.entity_name.clone();
            draft.affected_entity_id = change.entity_id.clone();
            draft.previous_data = change.previous_data.clone();
            draft.new_data = change.new_data.clone();
            // Only personal data feeds the sensitive access report
            draft.sensitive_fields_accessed =
                risk::personal_data_fields(&change.sensitive_fields_changed);
            if !change.changed_fields.is_empty() {
                draft.description = Some(format!(
                    "{} {}: {}",
                    event_type,
                    change.entity_name,
                    change.changed_fields.join(", ")
                ));
            }
        }
        AuditEventPayload::EntityAccessed(access) => {
            draft.affected_entity = access.entity_name.clone();
            draft.affected_entity_id = access.entity_id.clone();
        }
        AuditEventPayload::SensitiveDataAccessed(access)
        | AuditEventPayload::SensitiveDataExported(access) => {
            draft.affected_entity = access.entity_name.clone();
            draft.affected_entity_id = access.entity_id.clone();
            draft.sensitive_fields_accessed = access.fields.clone();
            draft.reason = access.reason.clone();
        }
        AuditEventPayload::Security(incident) => {
            draft.affected_entity = incident
                .entity_name
                .clone()
                .unwrap_or_else(|| "security".to_string());
            draft.description = Some(format!("{}: {}", event_type, incident.description));
        }
        AuditEventPayload::System(notice) => {
            draft.affected_entity = notice.component.clone();
            draft.description = Some(format!("{}: {}", event_type, notice.message));
        }
        AuditEventPayload::Login(attempt)
        | AuditEventPayload::Logout(attempt)
        | AuditEventPayload::FailedLogin(attempt) => {
            draft.affected_entity = "auth".to_string();
            draft.affected_entity_id = attempt.username.clone();
            draft.reason = attempt.reason.clone();
            if draft.user_id.is_none() {
                draft.user_id = attempt.username.clone();
            }
        }
    }

    if let Some(context) = &event.context {
        draft = draft.with_request(context);
    }
    draft
}

/// Where a write ended up
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Enqueued for the queue processor
    Queued(Uuid),
    /// Written directly through the core service
    Persisted(Vec<AuditLogRecord>),
}

/// Queue-first write path shared by all listeners
pub struct AuditWriter {
    queue: Option<Arc<dyn JobQueue>>,
    service: Arc<AuditService>,
    options: JobOptions,
    max_batch_size: usize,
}

impl std::fmt::Debug for AuditWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditWriter")
            .field("queued", &self.queue.is_some())
            .field("options", &self.options)
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

impl AuditWriter {
    /// Writer that persists directly through the core service
    pub fn new(service: Arc<AuditService>) -> Self {
        Self {
            queue: None,
            service,
            options: JobOptions::default(),
            max_batch_size: 100,
        }
    }

    /// Route writes through a job queue
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Write one draft
    pub async fn write(&self, draft: AuditLogDraft) -> Result<WriteOutcome> {
        draft.validate(Utc::now())?;

        if let Some(queue) = &self.queue {
            match queue.enqueue(AuditJob::single(draft.clone(), self.options)).await {
                Ok(job_id) => return Ok(WriteOutcome::Queued(job_id)),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        entity = %draft.affected_entity,
                        "Audit queue refused job, writing directly"
                    );
                }
            }
        }

        let record = self.service.create_audit_log(draft).await?;
        let records = vec![record];
        self.sign_direct(&records).await;
        Ok(WriteOutcome::Persisted(records))
    }

    /// Write many drafts, as batch jobs of at most `max_batch_size`
    ///
    /// Each chunk is persisted all-or-nothing.
    pub async fn write_batch(&self, drafts: Vec<AuditLogDraft>) -> Result<Vec<WriteOutcome>> {
        let now = Utc::now();
        for draft in &drafts {
            draft.validate(now)?;
        }

        let mut outcomes = Vec::new();
        for job in AuditJob::split_batch(drafts, self.max_batch_size, self.options) {
            if let Some(queue) = &self.queue {
                match queue.enqueue(job.clone()).await {
                    Ok(job_id) => {
                        outcomes.push(WriteOutcome::Queued(job_id));
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            drafts = job.draft_count(),
                            "Audit queue refused batch, writing directly"
                        );
                    }
                }
            }

            let records = self
                .service
                .create_audit_logs_batch(job.payload.drafts().to_vec())
                .await?;
            self.sign_direct(&records).await;
            outcomes.push(WriteOutcome::Persisted(records));
        }
        Ok(outcomes)
    }

    async fn sign_direct(&self, records: &[AuditLogRecord]) {
        if !self.options.sign || self.service.signer().is_none() {
            return;
        }
        if let Err(e) = self.service.sign_records(records).await {
            tracing::warn!(
                records = records.len(),
                error = %e,
                "Audit records persisted but not signed"
            );
        }
    }
}

/// Bus handler recording one event type
#[derive(Debug)]
pub struct AuditListener {
    name: String,
    event_type: AuditEventType,
    writer: Arc<AuditWriter>,
}

impl AuditListener {
    pub fn new(event_type: AuditEventType, writer: Arc<AuditWriter>) -> Self {
        Self {
            name: format!("audit-listener:{}", event_type),
            event_type,
            writer,
        }
    }

    pub fn event_type(&self) -> AuditEventType {
        self.event_type
    }

    /// Subscribe one listener per event type
    pub fn register_all(bus: &AuditEventBus, writer: Arc<AuditWriter>) -> Result<()> {
        for event_type in AuditEventType::ALL {
            let listener = Self::new(event_type, Arc::clone(&writer));
            bus.subscribe(event_type.topic(), Arc::new(listener))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditEventHandler for AuditListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &AuditEvent) -> Result<()> {
        let outcome = self.writer.write(draft_from_event(event)).await?;
        tracing::debug!(
            event_id = %event.id,
            event_type = %self.event_type,
            outcome = outcome_kind(&outcome),
            "Audit event recorded"
        );
        Ok(())
    }
}

fn outcome_kind(outcome: &WriteOutcome) -> &'static str {
    match outcome {
        WriteOutcome::Queued(_) => "queued",
        WriteOutcome::Persisted(_) => "persisted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::tests::business_hours;
    use crate::audit::event::{RequestContext, SecurityKind, SystemLevel};
    use crate::audit::queue::MemoryJobQueue;
    use crate::audit::query::SensitiveAccessReport;
    use crate::audit::storage::MemoryAuditStorage;
    use serde_json::json;

    fn writer() -> (AuditWriter, Arc<MemoryAuditStorage>) {
        let storage = Arc::new(MemoryAuditStorage::new());
        let service = Arc::new(AuditService::new(storage.clone()));
        (AuditWriter::new(service), storage)
    }

    #[test]
    fn test_operation_mapping_is_total() {
        for event_type in AuditEventType::ALL {
            let _ = operation_type_for(event_type);
        }
        assert_eq!(operation_type_for(AuditEventType::EntityAccessed), OperationType::Read);
        assert_eq!(operation_type_for(AuditEventType::SensitiveDataExported), OperationType::Export);
        assert_eq!(operation_type_for(AuditEventType::FailedLogin), OperationType::FailedLogin);
        assert_eq!(operation_type_for(AuditEventType::SecurityViolation), OperationType::Access);
        assert_eq!(operation_type_for(AuditEventType::SystemError), OperationType::Access);
    }

    #[test]
    fn test_update_draft_uses_field_classification() {
        let event = AuditEvent::entity_updated(
            "Usuario",
            "42",
            Some(json!({"email": "a@example.gov.br", "nome": "Ana"})),
            Some(json!({"email": "b@example.gov.br", "nome": "Ana"})),
            Vec::new(),
        )
        .with_timestamp(business_hours())
        .with_user("7")
        .with_context(RequestContext::new("PUT", "/api/usuarios/42").with_ip("10.0.0.1"));

        let draft = draft_from_event(&event);
        assert_eq!(draft.operation_type, Some(OperationType::Update));
        assert_eq!(draft.affected_entity, "Usuario");
        assert_eq!(draft.affected_entity_id.as_deref(), Some("42"));
        assert_eq!(draft.risk_level, Some(RiskLevel::High));
        assert!(draft.sensitive_fields_accessed.is_empty());
        assert_eq!(draft.http_method.as_deref(), Some("PUT"));
        assert_eq!(draft.source_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(draft.occurred_at, Some(business_hours()));
        assert_eq!(draft.user_id.as_deref(), Some("7"));
    }

    #[test]
    fn test_sensitive_field_update_is_medium() {
        let event = AuditEvent::entity_updated("Usuario", "42", None, None, vec!["phone".into()])
            .with_timestamp(business_hours());
        let draft = draft_from_event(&event);
        assert_eq!(draft.risk_level, Some(RiskLevel::Medium));
        assert_eq!(draft.sensitive_fields_accessed, vec!["phone".to_string()]);

        let event = AuditEvent::entity_updated("Usuario", "42", None, None, vec!["nome".into()])
            .with_timestamp(business_hours());
        assert_eq!(draft_from_event(&event).risk_level, Some(RiskLevel::Low));
    }

    #[test]
    fn test_status_change_is_not_personal_data_access() {
        let event = AuditEvent::entity_updated(
            "Beneficio",
            "3",
            None,
            None,
            vec!["status".into(), "phone".into()],
        )
        .with_timestamp(business_hours());
        let draft = draft_from_event(&event);
        assert_eq!(draft.risk_level, Some(RiskLevel::High));
        assert_eq!(draft.sensitive_fields_accessed, vec!["phone".to_string()]);

        let event = AuditEvent::entity_updated("Beneficio", "3", None, None, vec!["status".into()])
            .with_timestamp(business_hours());
        let record = draft_from_event(&event)
            .into_record(Uuid::now_v7(), Utc::now())
            .unwrap();
        let report = SensitiveAccessReport::build(
            record.created_at - chrono::Duration::seconds(1),
            record.created_at + chrono::Duration::seconds(1),
            [&record],
        );
        assert_eq!(report.total, 0);
    }

    #[test]
    fn test_pinned_risk_wins() {
        let event = AuditEvent::entity_updated("Usuario", "42", None, None, vec!["email".into()])
            .with_risk_level(RiskLevel::Low);
        assert_eq!(draft_from_event(&event).risk_level, Some(RiskLevel::Low));
    }

    #[test]
    fn test_non_entity_events_get_an_entity() {
        let draft = draft_from_event(&AuditEvent::security_event(
            SecurityKind::UnauthorizedAccess,
            "token reuse detected",
        ));
        assert_eq!(draft.affected_entity, "security");
        assert!(draft.description.unwrap().contains("token reuse"));

        let draft = draft_from_event(&AuditEvent::system_event(
            SystemLevel::Error,
            "scheduler",
            "job crashed",
        ));
        assert_eq!(draft.affected_entity, "scheduler");

        let draft = draft_from_event(&AuditEvent::failed_login("maria", "bad password"));
        assert_eq!(draft.operation_type, Some(OperationType::FailedLogin));
        assert_eq!(draft.affected_entity, "auth");
        assert_eq!(draft.user_id.as_deref(), Some("maria"));
        assert_eq!(draft.reason.as_deref(), Some("bad password"));
    }

    #[test]
    fn test_sensitive_access_draft() {
        let event = AuditEvent::sensitive_export(
            "Usuario",
            "42",
            vec!["cpf".into(), "salary".into()],
            Some("court order".into()),
        );
        let draft = draft_from_event(&event);
        assert_eq!(draft.operation_type, Some(OperationType::Export));
        assert_eq!(draft.sensitive_fields_accessed.len(), 2);
        assert_eq!(draft.reason.as_deref(), Some("court order"));
    }

    #[tokio::test]
    async fn test_writer_prefers_queue() {
        let (writer, storage) = writer();
        let queue = Arc::new(MemoryJobQueue::new());
        let writer = writer.with_queue(queue.clone());

        let outcome = writer
            .write(AuditLogDraft::new(OperationType::Read, "Beneficio"))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Queued(_)));
        assert_eq!(queue.pending_count().await.unwrap(), 1);
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_writer_falls_back_when_queue_refuses() {
        let (writer, storage) = writer();
        let queue = Arc::new(MemoryJobQueue::new());
        queue.close();
        let writer = writer.with_queue(queue);

        let outcome = writer
            .write(AuditLogDraft::new(OperationType::Read, "Beneficio"))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Persisted(ref r) if r.len() == 1));
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_writer_rejects_invalid_draft_before_queueing() {
        let (writer, _) = writer();
        let queue = Arc::new(MemoryJobQueue::new());
        let writer = writer.with_queue(queue.clone());

        assert!(writer.write(AuditLogDraft::default()).await.is_err());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_batch_splits_into_jobs() {
        let (writer, storage) = writer();
        let queue = Arc::new(MemoryJobQueue::new());
        let writer = writer.with_queue(queue.clone()).with_max_batch_size(4);

        let drafts = (0..10)
            .map(|i| AuditLogDraft::new(OperationType::Create, "Beneficio").with_entity_id(i.to_string()))
            .collect();
        let outcomes = writer.write_batch(drafts).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(queue.pending_count().await.unwrap(), 3);

        let (direct, _) = self::writer();
        let drafts = (0..3)
            .map(|_| AuditLogDraft::new(OperationType::Create, "Beneficio"))
            .collect();
        let outcomes = direct.write_batch(drafts).await.unwrap();
        assert!(matches!(&outcomes[..], [WriteOutcome::Persisted(r)] if r.len() == 3));
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_all_subscribes_every_type() {
        let (writer, _) = writer();
        let bus = AuditEventBus::new();
        let writer = Arc::new(writer);
        AuditListener::register_all(&bus, writer.clone()).unwrap();
        assert_eq!(bus.handler_count(), AuditEventType::ALL.len());
        assert!(AuditListener::register_all(&bus, writer).is_err());
    }

    #[tokio::test]
    async fn test_listener_persists_event() {
        let (writer, storage) = writer();
        let bus = AuditEventBus::new();
        AuditListener::register_all(&bus, Arc::new(writer)).unwrap();

        bus.publish_and_wait(&AuditEvent::login("maria")).await;
        let records = storage.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation_type, OperationType::Login);
    }
}
