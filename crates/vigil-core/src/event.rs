//! Notification events and the sink contract.
//!
//! Alert and recovery transitions are emitted as [`Event`]s to a
//! [`NotificationSink`]. Delivery (email, webhook, chat) is the sink's
//! business; the engine only hands events over and never waits on retries.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::types::{epoch_secs, Severity};

/// Boxed future returned by the engine's async contracts.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The kind of a notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AlertFired,
    AlertResolved,
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryFailed,
}

/// A notification handed to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Rule name the event is about.
    pub subject: String,
    /// Human-readable summary.
    pub message: String,
    pub severity: Option<Severity>,
    /// Structured details (alert instance, execution record).
    pub payload: serde_json::Value,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}

impl Event {
    pub fn new(kind: EventKind, subject: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.to_string(),
            message: message.into(),
            severity: None,
            payload: serde_json::Value::Null,
            timestamp: epoch_secs(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Attach a serializable payload. Serialization failures leave the
    /// payload empty.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        self
    }
}

/// Receives alert and recovery events for delivery.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: Event) -> BoxFuture<'_, ()>;
}

/// Writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: Event) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match event.kind {
                EventKind::AlertFired | EventKind::RecoveryFailed => warn!(
                    kind = ?event.kind,
                    subject = %event.subject,
                    severity = ?event.severity,
                    "{}",
                    event.message
                ),
                _ => info!(
                    kind = ?event.kind,
                    subject = %event.subject,
                    "{}",
                    event.message
                ),
            }
        })
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _event: Event) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Keeps every event in memory. Useful for dashboards and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far, oldest first.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Number of events of one kind.
    pub async fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

impl NotificationSink for MemorySink {
    fn notify(&self, event: Event) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.events.lock().await.push(event);
        })
    }
}
