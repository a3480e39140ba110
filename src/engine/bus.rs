//! In-process event bus connecting the fingerprint engine and the healing
//! orchestrator.
//!
//! Delivery rules:
//! 1. An event goes to every handler subscribed to its [`EventType`].
//! 2. Each handler runs in its own task; an error or panic in one handler is
//!    logged and never stops delivery to the others.
//! 3. `publish` resolves once every handler has returned. Handlers that start
//!    long-running work spawn it instead of awaiting it.
//! 4. Failed handlers are not retried.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::AppError;

use super::types::{Fingerprint, HealingResult, LogEntry};

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    FingerprintUpdated,
    HealingTriggered,
    HealingCompleted,
    HealingFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FingerprintUpdated => "fingerprint.updated",
            EventType::HealingTriggered => "healing.triggered",
            EventType::HealingCompleted => "healing.completed",
            EventType::HealingFailed => "healing.failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    FingerprintUpdated {
        fingerprint: Fingerprint,
        entry: LogEntry,
    },
    HealingTriggered {
        attempt_id: String,
        fingerprint: Fingerprint,
    },
    HealingCompleted {
        fingerprint: Fingerprint,
        result: HealingResult,
        elapsed_ms: u64,
    },
    HealingFailed {
        fingerprint: Fingerprint,
        reason: String,
        strategies_attempted: usize,
        elapsed_ms: u64,
    },
}

/// Envelope for everything that crosses the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub aggregate_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub payload: EventPayload,
}

impl BusEvent {
    pub fn new(aggregate_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
            payload,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        match self.payload {
            EventPayload::FingerprintUpdated { .. } => EventType::FingerprintUpdated,
            EventPayload::HealingTriggered { .. } => EventType::HealingTriggered,
            EventPayload::HealingCompleted { .. } => EventType::HealingCompleted,
            EventPayload::HealingFailed { .. } => EventType::HealingFailed,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Label used in delivery failure logs.
    fn name(&self) -> &'static str {
        "handler"
    }

    async fn handle(&self, event: BusEvent) -> Result<(), AppError>;
}

/// Forwards every event it receives into an unbounded channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<BusEvent>,
}

impl ChannelHandler {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn handle(&self, event: BusEvent) -> Result<(), AppError> {
        self.tx
            .send(event)
            .map_err(|_| AppError::Internal("event channel closed".into()))
    }
}

// =============================================================================
// Bus
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(event_type).or_default().push(handler);
        tracing::debug!(event_type = %event_type, "Handler subscribed");
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_type)
            .map_or(0, |h| h.len())
    }

    pub async fn publish(&self, event: BusEvent) {
        let event_type = event.event_type();
        self.published.fetch_add(1, Ordering::Relaxed);

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_type)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::trace!(event_type = %event_type, "No subscribers for event");
            return;
        }

        let deliveries = handlers.into_iter().map(|handler| {
            let event = event.clone();
            let name = handler.name();
            (name, tokio::spawn(async move { handler.handle(event).await }))
        });
        let (names, tasks): (Vec<_>, Vec<_>) = deliveries.unzip();
        let results = futures_util::future::join_all(tasks).await;

        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event_type = %event_type,
                        aggregate_id = %event.aggregate_id,
                        handler = name,
                        "Event handler failed: {}", e
                    );
                }
                Err(join_err) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        event_type = %event_type,
                        aggregate_id = %event.aggregate_id,
                        handler = name,
                        "Event handler panicked: {}", join_err
                    );
                }
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}
