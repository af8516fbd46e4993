//! In-process audit event bus
//!
//! Named-topic fan-out. Each subscribed handler runs in its own task, so a
//! slow, failing or panicking handler never reaches the publisher or its
//! siblings. Handler errors are logged here and go no further.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;

use super::event::AuditEvent;
use crate::error::{Error, Result};

/// A subscriber for audit events on one topic
#[async_trait]
pub trait AuditEventHandler: Send + Sync {
    /// Name, unique per topic
    fn name(&self) -> &str;

    async fn handle(&self, event: &AuditEvent) -> Result<()>;
}

type Handlers = HashMap<&'static str, Vec<Arc<dyn AuditEventHandler>>>;

/// Topic-based publish/subscribe for [`AuditEvent`]s
#[derive(Default)]
pub struct AuditEventBus {
    handlers: RwLock<Handlers>,
    /// Handler dispatches spawned by [`publish`](Self::publish) still running
    in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for AuditEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditEventBus")
            .field("handlers", &self.handler_count())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl AuditEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to a topic
    ///
    /// Fails with [`Error::AlreadyRegistered`] if a handler with the same
    /// name already listens on the topic.
    pub fn subscribe(
        &self,
        topic: &'static str,
        handler: Arc<dyn AuditEventHandler>,
    ) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let subscribers = handlers.entry(topic).or_default();
        if subscribers.iter().any(|h| h.name() == handler.name()) {
            return Err(Error::AlreadyRegistered(format!(
                "handler '{}' on topic '{}'",
                handler.name(),
                topic
            )));
        }

        tracing::debug!(topic, handler = handler.name(), "Audit handler subscribed");
        subscribers.push(handler);
        Ok(())
    }

    /// Handlers subscribed across all topics
    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Dispatches started by `publish` that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn subscribers(&self, topic: &str) -> Vec<Arc<dyn AuditEventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Fan an event out to its topic's handlers without waiting for them
    ///
    /// Returns the number of handlers the event was dispatched to.
    pub fn publish(&self, event: AuditEvent) -> usize {
        let subscribers = self.subscribers(event.topic());
        if subscribers.is_empty() {
            tracing::debug!(topic = event.topic(), event_id = %event.id, "No audit handlers for topic");
            return 0;
        }

        let event = Arc::new(event);
        for handler in &subscribers {
            let handler = Arc::clone(handler);
            let event = Arc::clone(&event);
            let in_flight = Arc::clone(&self.in_flight);
            in_flight.fetch_add(1, Ordering::AcqRel);
            tokio::spawn(async move {
                dispatch(handler.as_ref(), &event).await;
                in_flight.fetch_sub(1, Ordering::AcqRel);
            });
        }
        subscribers.len()
    }

    /// Run every handler for the event and wait for all of them
    pub async fn publish_and_wait(&self, event: &AuditEvent) -> usize {
        let subscribers = self.subscribers(event.topic());
        futures::future::join_all(subscribers.iter().map(|h| dispatch(h.as_ref(), event))).await;
        subscribers.len()
    }
}

/// Run one handler, containing its errors and panics
async fn dispatch(handler: &dyn AuditEventHandler, event: &AuditEvent) {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(
                handler = handler.name(),
                topic = event.topic(),
                event_id = %event.id,
                error = %e,
                "Audit handler failed"
            );
        }
        Err(_) => {
            tracing::error!(
                handler = handler.name(),
                topic = event.topic(),
                event_id = %event.id,
                "Audit handler panicked"
            );
        }
    }
}
