//! Audit event emitter
//!
//! The publish API for instrumented call sites. [`AuditEmitter::emit`] validates
//! the event and hands it to an unbounded channel; the [`EmitterDispatcher`]
//! task drains the channel onto the bus. Emitting never blocks and never fails
//! the caller: rejected events are reported through `tracing` only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use super::bus::AuditEventBus;
use super::dedup::{RequestDeduplicator, RequestKey};
use super::event::{AuditEvent, SecurityKind, SystemLevel};

/// Per-emission options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitOptions {
    /// Run handlers in the caller's task and wait for them
    pub synchronous: bool,
}

impl EmitOptions {
    pub fn synchronous() -> Self {
        Self { synchronous: true }
    }
}

/// Handle used by call sites to publish audit events
#[derive(Clone)]
pub struct AuditEmitter {
    bus: Arc<AuditEventBus>,
    sender: mpsc::UnboundedSender<AuditEvent>,
    dedup: Option<Arc<RequestDeduplicator>>,
    /// Events accepted but not yet handed to the bus
    pending: Arc<AtomicUsize>,
}

impl std::fmt::Debug for AuditEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditEmitter")
            .field("pending", &self.pending())
            .field("dedup", &self.dedup.is_some())
            .finish()
    }
}

/// Moves emitted events from the channel onto the bus
pub struct EmitterDispatcher {
    bus: Arc<AuditEventBus>,
    receiver: mpsc::UnboundedReceiver<AuditEvent>,
    pending: Arc<AtomicUsize>,
}

impl EmitterDispatcher {
    /// Run until every emitter handle is dropped
    pub async fn run(mut self) -> anyhow::Result<()> {
        while let Some(event) = self.receiver.recv().await {
            self.bus.publish(event);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::debug!("Audit emitter dispatcher stopped");
        Ok(())
    }
}

impl AuditEmitter {
    /// Create an emitter and the dispatcher that must run for it
    pub fn new(
        bus: Arc<AuditEventBus>,
        dedup: Option<Arc<RequestDeduplicator>>,
    ) -> (Self, EmitterDispatcher) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let emitter = Self {
            bus: Arc::clone(&bus),
            sender,
            dedup,
            pending: Arc::clone(&pending),
        };
        let dispatcher = EmitterDispatcher {
            bus,
            receiver,
            pending,
        };
        (emitter, dispatcher)
    }

    /// Events waiting for the dispatcher
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn deduplicator(&self) -> Option<&Arc<RequestDeduplicator>> {
        self.dedup.as_ref()
    }

    fn accept(&self, event: &AuditEvent) -> bool {
        match event.validate() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type(),
                    error = %e,
                    "Audit event rejected"
                );
                false
            }
        }
    }

    /// Publish an event without waiting for its handlers
    pub fn emit(&self, event: AuditEvent) {
        if !self.accept(&event) {
            return;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(event)) = self.sender.send(event) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(
                event_id = %event.id,
                topic = event.topic(),
                "Audit dispatcher is not running, event dropped"
            );
        }
    }

    /// Publish an event, optionally running handlers before returning
    pub async fn emit_with(&self, event: AuditEvent, options: EmitOptions) {
        if !options.synchronous {
            self.emit(event);
            return;
        }
        if self.accept(&event) {
            self.bus.publish_and_wait(&event).await;
        }
    }

    /// Publish an event observed at a request capture point
    ///
    /// Events whose request was already seen within the deduplication window
    /// are skipped. Returns whether the event was emitted.
    pub fn emit_request(&self, event: AuditEvent) -> bool {
        if !self.accept(&event) {
            return false;
        }

        if let (Some(dedup), Some(key)) = (&self.dedup, RequestKey::from_event(&event)) {
            if dedup.check_and_mark(&key).is_none() {
                tracing::debug!(
                    event_id = %event.id,
                    method = %key.method,
                    url = %key.url,
                    "Duplicate audit capture skipped"
                );
                return false;
            }
        }

        self.emit(event);
        true
    }

    /// Decode a JSON event and publish it
    pub fn emit_json(&self, json: &str) {
        match AuditEvent::from_json(json) {
            Ok(event) => self.emit(event),
            Err(e) => tracing::warn!(error = %e, "Audit event rejected"),
        }
    }

    pub fn entity_created(&self, entity: &str, id: &str, new_data: Value, user_id: Option<&str>) {
        self.emit(with_user(AuditEvent::entity_created(entity, id, new_data), user_id));
    }

    pub fn entity_updated(
        &self,
        entity: &str,
        id: &str,
        previous_data: Option<Value>,
        new_data: Option<Value>,
        changed_fields: Vec<String>,
        user_id: Option<&str>,
    ) {
        let event =
            AuditEvent::entity_updated(entity, id, previous_data, new_data, changed_fields);
        self.emit(with_user(event, user_id));
    }

    pub fn entity_deleted(
        &self,
        entity: &str,
        id: &str,
        previous_data: Option<Value>,
        user_id: Option<&str>,
    ) {
        self.emit(with_user(
            AuditEvent::entity_deleted(entity, id, previous_data),
            user_id,
        ));
    }

    pub fn sensitive_access(
        &self,
        entity: &str,
        id: &str,
        fields: Vec<String>,
        reason: Option<String>,
        user_id: Option<&str>,
    ) {
        self.emit(with_user(
            AuditEvent::sensitive_access(entity, id, fields, reason),
            user_id,
        ));
    }

    pub fn entity_accessed(&self, entity: &str, id: &str, user_id: Option<&str>) {
        self.emit(with_user(AuditEvent::entity_accessed(entity, id), user_id));
    }

    pub fn sensitive_export(
        &self,
        entity: &str,
        id: &str,
        fields: Vec<String>,
        reason: Option<String>,
        user_id: Option<&str>,
    ) {
        self.emit(with_user(
            AuditEvent::sensitive_export(entity, id, fields, reason),
            user_id,
        ));
    }

    pub fn login(&self, username: &str) {
        self.emit(AuditEvent::login(username));
    }

    pub fn logout(&self, username: &str) {
        self.emit(AuditEvent::logout(username));
    }

    /// Failed logins score +30 before any other factor
    pub fn failed_login(&self, username: &str, reason: &str) {
        self.emit(AuditEvent::failed_login(username, reason));
    }

    pub fn security_event(&self, kind: SecurityKind, description: &str, user_id: Option<&str>) {
        self.emit(with_user(AuditEvent::security_event(kind, description), user_id));
    }

    pub fn system_event(&self, level: SystemLevel, component: &str, message: &str) {
        self.emit(AuditEvent::system_event(level, component, message));
    }
}

fn with_user(event: AuditEvent, user_id: Option<&str>) -> AuditEvent {
    match user_id {
        Some(user) => event.with_user(user),
        None => event,
    }
}
