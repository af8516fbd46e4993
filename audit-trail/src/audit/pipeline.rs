//! Audit pipeline bootstrap
//!
//! Wires the pieces together in dependency order:
//!
//! ```text
//! call site -> AuditEmitter -> AuditEventBus -> AuditListener -> AuditWriter
//!           -> JobQueue -> QueueProcessor -> AuditService -> AuditStorage
//! ```
//!
//! The write path is queue-first. With the queue disabled, or when it refuses
//! a job, listeners write through [`AuditService`] directly. Both paths end in
//! the same `create_audit_log` contract.
//!
//! # Example
//!
//! ```rust,ignore
//! let pipeline = AuditPipeline::builder(Config::load()?).start().await?;
//!
//! pipeline.emitter().entity_updated(
//!     "Usuario", "42", None, None, vec!["email".into()], Some("7"),
//! );
//!
//! pipeline.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use super::alert::{AuditAlertHook, TracingAlertHook};
use super::bus::AuditEventBus;
use super::dedup::RequestDeduplicator;
use super::emitter::AuditEmitter;
use super::failure_tracker::FailureTracker;
use super::listener::{AuditListener, AuditWriter};
use super::queue::{
    JobOptions, JobQueue, MemoryJobQueue, ProcessorRegistry, QueueProcessor, RetryPolicy,
};
use super::service::AuditService;
use super::signature::SignatureService;
use super::storage::{AuditStorage, MemoryAuditStorage};
use crate::agents::BackgroundWorker;
use crate::config::Config;
use crate::error::{Error, Result};

/// Configures and starts an [`AuditPipeline`]
pub struct AuditPipelineBuilder {
    config: Config,
    storage: Option<Arc<dyn AuditStorage>>,
    queue: Option<Arc<dyn JobQueue>>,
    alert_hooks: Vec<Arc<dyn AuditAlertHook>>,
    registry: ProcessorRegistry,
}

impl AuditPipelineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            storage: None,
            queue: None,
            alert_hooks: Vec::new(),
            registry: ProcessorRegistry::new(),
        }
    }

    /// Use this storage instead of the configured one
    pub fn with_storage(mut self, storage: Arc<dyn AuditStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use this queue backend instead of an in-process queue
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Add an alert hook; without any, alerts are logged
    pub fn with_alert_hook(mut self, hook: Arc<dyn AuditAlertHook>) -> Self {
        self.alert_hooks.push(hook);
        self
    }

    /// Share a processor registry with other pipelines in the process
    pub fn with_registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = registry;
        self
    }

    async fn storage(&mut self) -> Result<Arc<dyn AuditStorage>> {
        if let Some(storage) = self.storage.take() {
            return Ok(storage);
        }

        #[cfg(feature = "database")]
        if let Some(db) = &self.config.database {
            let storage = super::storage::PgAuditStorage::connect(db).await?;
            return Ok(Arc::new(storage));
        }

        tracing::warn!("No audit database configured, audit logs are kept in memory only");
        Ok(Arc::new(MemoryAuditStorage::new()))
    }

    /// Fails with a configuration error when signing is on but no key is set
    fn signer(&self) -> Result<Option<Arc<SignatureService>>> {
        let signing = &self.config.signing;
        if !signing.enabled {
            tracing::warn!("Audit signing disabled by configuration, records carry no integrity token");
            return Ok(None);
        }
        Ok(Some(Arc::new(SignatureService::new(signing)?)))
    }

    /// Build every component and start the background tasks
    pub async fn start(mut self) -> Result<AuditPipeline> {
        self.config.validate()?;

        let signer = self.signer()?;
        let storage = self.storage().await?;
        let mut service = AuditService::new(storage);
        if let Some(signer) = signer.clone() {
            service = service.with_signer(signer);
        }
        let service = Arc::new(service);

        let queue_config = &self.config.queue;
        let queue: Option<Arc<dyn JobQueue>> = if queue_config.enabled {
            Some(
                self.queue
                    .take()
                    .unwrap_or_else(|| Arc::new(MemoryJobQueue::from_config(queue_config))),
            )
        } else {
            None
        };

        let mut writer = AuditWriter::new(Arc::clone(&service))
            .with_options(JobOptions {
                compress: queue_config.compress,
                sign: signer.is_some(),
            })
            .with_max_batch_size(queue_config.max_batch_size);
        if let Some(queue) = &queue {
            writer = writer.with_queue(Arc::clone(queue));
        }
        let writer = Arc::new(writer);

        let bus = Arc::new(AuditEventBus::new());
        AuditListener::register_all(&bus, Arc::clone(&writer))?;

        let dedup = self
            .config
            .dedup
            .enabled
            .then(|| Arc::new(RequestDeduplicator::from_config(&self.config.dedup)));
        let (emitter, dispatcher) = AuditEmitter::new(Arc::clone(&bus), dedup.clone());

        let tracker = match &self.config.alerts {
            Some(alerts) if alerts.enabled => {
                let hooks = if self.alert_hooks.is_empty() {
                    vec![Arc::new(TracingAlertHook) as Arc<dyn AuditAlertHook>]
                } else {
                    std::mem::take(&mut self.alert_hooks)
                };
                Some(Arc::new(FailureTracker::from_config(
                    hooks,
                    alerts,
                    self.config.service.name.clone(),
                )))
            }
            _ => None,
        };

        let processor = match &queue {
            Some(queue) => {
                let binding = self.registry.bind(queue_config.processor_name.clone())?;
                let mut processor = QueueProcessor::new(
                    binding,
                    Arc::clone(queue),
                    Arc::clone(&service),
                    RetryPolicy::from_config(queue_config),
                );
                if let Some(tracker) = &tracker {
                    processor = processor.with_failure_tracker(Arc::clone(tracker));
                }
                Some(Arc::new(processor))
            }
            None => None,
        };

        let worker = BackgroundWorker::new();
        worker.submit("audit-emitter-dispatcher", move || dispatcher.run())?;

        if let Some(processor) = &processor {
            let poll_interval = queue_config.poll_interval();
            for worker_id in 0..queue_config.workers {
                let processor = Arc::clone(processor);
                worker.submit(format!("audit-queue-worker-{}", worker_id), move || {
                    processor.run_worker(worker_id, poll_interval)
                })?;
            }
        }

        if let Some(dedup) = &dedup {
            let dedup = Arc::clone(dedup);
            let interval = self.config.dedup.sweep_interval();
            worker.submit("audit-dedup-sweep", move || dedup.run_sweeper(interval))?;
        }

        let workers = if processor.is_some() { queue_config.workers } else { 0 };
        tracing::info!(
            service = %self.config.service.name,
            queued = queue.is_some(),
            workers,
            signing = signer.is_some(),
            compress = queue_config.compress,
            dedup = dedup.is_some(),
            handlers = bus.handler_count(),
            "Audit pipeline started"
        );

        Ok(AuditPipeline {
            bus,
            emitter,
            service,
            writer,
            queue,
            dedup,
            processor,
            worker,
        })
    }
}

/// A running audit pipeline
pub struct AuditPipeline {
    bus: Arc<AuditEventBus>,
    emitter: AuditEmitter,
    service: Arc<AuditService>,
    writer: Arc<AuditWriter>,
    queue: Option<Arc<dyn JobQueue>>,
    dedup: Option<Arc<RequestDeduplicator>>,
    processor: Option<Arc<QueueProcessor>>,
    worker: BackgroundWorker,
}

impl std::fmt::Debug for AuditPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditPipeline")
            .field("emitter", &self.emitter)
            .field("processor", &self.processor)
            .field("tasks", &self.worker.task_count())
            .finish_non_exhaustive()
    }
}

impl AuditPipeline {
    pub fn builder(config: Config) -> AuditPipelineBuilder {
        AuditPipelineBuilder::new(config)
    }

    /// Publish API for call sites
    pub fn emitter(&self) -> &AuditEmitter {
        &self.emitter
    }

    /// Direct write and read API
    pub fn service(&self) -> &Arc<AuditService> {
        &self.service
    }

    /// Queue-first writer used by the listeners
    pub fn writer(&self) -> &Arc<AuditWriter> {
        &self.writer
    }

    pub fn bus(&self) -> &Arc<AuditEventBus> {
        &self.bus
    }

    /// `None` when the queue is disabled
    pub fn queue(&self) -> Option<&Arc<dyn JobQueue>> {
        self.queue.as_ref()
    }

    pub fn deduplicator(&self) -> Option<&Arc<RequestDeduplicator>> {
        self.dedup.as_ref()
    }

    pub fn worker(&self) -> &BackgroundWorker {
        &self.worker
    }

    /// Wait until every emitted event has been handled and every queued job
    /// has completed or been parked
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let queued = match &self.queue {
                Some(queue) => queue.pending_count().await?,
                None => 0,
            };
            if self.emitter.pending() == 0 && self.bus.in_flight() == 0 && queued == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Internal(format!(
                    "audit pipeline did not drain within {:?} ({} events, {} handlers, {} jobs pending)",
                    timeout,
                    self.emitter.pending(),
                    self.bus.in_flight(),
                    queued
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop every background task
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
        tracing::info!("Audit pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{AuditEvent, RequestContext};
    use crate::audit::queue::compress::{decompress_value, is_compressed};
    use crate::audit::queue::JobState;
    use crate::audit::record::OperationType;
    use crate::audit::risk::RiskLevel;
    use crate::audit::signature::tests::signing_config;
    use crate::audit::storage::testing::FlakyStorage;
    use crate::config::SigningConfig;
    use chrono::Utc;

    const DRAIN: Duration = Duration::from_secs(5);

    fn config() -> Config {
        let mut config = Config::default();
        config.queue.poll_interval_ms = 10;
        config.queue.base_delay_ms = 10;
        config.queue.max_delay_ms = 1_000;
        config.signing = signing_config();
        config
    }

    async fn start(config: Config, storage: Arc<dyn AuditStorage>) -> AuditPipeline {
        AuditPipeline::builder(config)
            .with_storage(storage)
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_email_update_produces_one_high_risk_record() {
        let storage = Arc::new(MemoryAuditStorage::new());
        let pipeline = start(config(), storage.clone()).await;

        pipeline.emitter().entity_updated(
            "Usuario",
            "42",
            None,
            None,
            vec!["email".to_string()],
            Some("7"),
        );
        pipeline.drain(DRAIN).await.unwrap();

        let records = storage.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation_type, OperationType::Update);
        assert_eq!(records[0].risk_level, Some(RiskLevel::High));
        assert_eq!(records[0].affected_entity, "Usuario");
        assert_eq!(records[0].affected_entity_id.as_deref(), Some("42"));

        let page = pipeline
            .service()
            .find_by_entity("Usuario", Some("42"), 1)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_capture_points_write_once() {
        let storage = Arc::new(MemoryAuditStorage::new());
        let pipeline = start(config(), storage.clone()).await;

        let observed = Utc::now();
        let capture = |source: &str| {
            AuditEvent::entity_accessed("Beneficio", "9")
                .with_timestamp(observed)
                .with_user("7")
                .with_context(
                    RequestContext::new("GET", "/api/beneficios/9?expand=true").with_ip("10.1.1.1"),
                )
                .with_metadata("capture_point", serde_json::json!(source))
        };

        assert!(pipeline.emitter().emit_request(capture("interceptor")));
        assert!(!pipeline.emitter().emit_request(capture("route")));
        pipeline.drain(DRAIN).await.unwrap();

        assert_eq!(storage.len().await, 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_storage_parks_job_then_requeue_recovers() {
        let storage = FlakyStorage::new();
        storage.fail_next(2);
        let mut config = config();
        config.queue.max_attempts = 2;
        let pipeline = start(config, storage.clone()).await;

        pipeline
            .emitter()
            .entity_deleted("Beneficio", "3", None, Some("7"));
        pipeline.drain(DRAIN).await.unwrap();

        let queue = pipeline.queue().unwrap();
        let failed = queue.failed_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].state, JobState::Failed);
        assert_eq!(failed[0].attempts, 2);
        assert!(storage.inner.is_empty().await);

        queue.requeue_failed(failed[0].id).await.unwrap();
        pipeline.drain(DRAIN).await.unwrap();
        assert_eq!(storage.inner.len().await, 1);
        assert!(queue.failed_jobs().await.unwrap().is_empty());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_refused_jobs_fall_back_to_direct_write() {
        let storage = Arc::new(MemoryAuditStorage::new());
        let queue = Arc::new(MemoryJobQueue::new());
        queue.close();
        let pipeline = AuditPipeline::builder(config())
            .with_storage(storage.clone())
            .with_queue(queue)
            .start()
            .await
            .unwrap();

        pipeline.emitter().emit(AuditEvent::login("maria"));
        pipeline.drain(DRAIN).await.unwrap();

        let records = storage.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation_type, OperationType::Login);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_queue_writes_directly() {
        let storage = Arc::new(MemoryAuditStorage::new());
        let mut config = config();
        config.queue.enabled = false;
        let pipeline = start(config, storage.clone()).await;
        assert!(pipeline.queue().is_none());

        pipeline.emitter().emit(AuditEvent::logout("maria"));
        pipeline.drain(DRAIN).await.unwrap();
        assert_eq!(storage.len().await, 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_signed_records_verify() {
        let storage = Arc::new(MemoryAuditStorage::new());
        let pipeline = start(config(), storage.clone()).await;

        pipeline.emitter().entity_created(
            "Beneficio",
            "11",
            serde_json::json!({"tipo": "auxilio"}),
            Some("7"),
        );
        pipeline.drain(DRAIN).await.unwrap();

        let records = storage.all().await;
        assert_eq!(records.len(), 1);
        pipeline.service().verify_log(records[0].id).await.unwrap();
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_processor_name_binds_once_per_registry() {
        let registry = ProcessorRegistry::new();
        let first = AuditPipeline::builder(config())
            .with_storage(Arc::new(MemoryAuditStorage::new()))
            .with_registry(registry.clone())
            .start()
            .await
            .unwrap();

        let second = AuditPipeline::builder(config())
            .with_storage(Arc::new(MemoryAuditStorage::new()))
            .with_registry(registry.clone())
            .start()
            .await;
        assert!(matches!(second, Err(Error::AlreadyRegistered(_))));

        first.shutdown().await;
        drop(first);
        assert!(!registry.is_bound("audit-log"));
    }

    #[tokio::test]
    async fn test_missing_signing_key_fails_startup() {
        let result = AuditPipeline::builder(Config::default())
            .with_storage(Arc::new(MemoryAuditStorage::new()))
            .start()
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));

        // Unsigned mode is an explicit opt-out
        let storage = Arc::new(MemoryAuditStorage::new());
        let mut config = config();
        config.signing = SigningConfig {
            enabled: false,
            ..SigningConfig::default()
        };
        let pipeline = start(config, storage.clone()).await;
        pipeline.emitter().emit(AuditEvent::login("maria"));
        pipeline.drain(DRAIN).await.unwrap();

        let records = storage.all().await;
        assert_eq!(records.len(), 1);
        assert!(storage.signature_for(records[0].id).await.unwrap().is_none());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_configured_compression_reaches_stored_records() {
        let storage = Arc::new(MemoryAuditStorage::new());
        let mut config = config();
        config.queue.compress = true;
        let pipeline = start(config, storage.clone()).await;

        pipeline.emitter().entity_created(
            "Beneficio",
            "12",
            serde_json::json!({"tipo": "auxilio"}),
            Some("7"),
        );
        pipeline.drain(DRAIN).await.unwrap();

        let records = storage.all().await;
        assert_eq!(records.len(), 1);
        let stored = records[0].new_data.as_ref().unwrap();
        assert!(is_compressed(stored));
        assert_eq!(
            decompress_value(stored).unwrap(),
            serde_json::json!({"tipo": "auxilio"})
        );
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.queue.workers = 0;
        let result = AuditPipeline::builder(config).start().await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
