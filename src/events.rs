//! Observer-capability event bus.
//!
//! The source this engine is modeled after uses a publish/subscribe
//! notifier with global listeners; here the event surface is a closed
//! enum broadcast over a bounded channel so a test harness can collect
//! events deterministically instead of registering ad-hoc callbacks.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::message::MessageStatus;

/// The closed set of events the engine emits to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Event {
    Enqueued {
        id: Uuid,
        message_type: String,
        priority: i32,
    },
    Dequeued {
        id: Uuid,
        message_type: String,
    },
    Ack {
        id: Uuid,
    },
    Nack {
        id: Uuid,
        retry_count: i32,
        new_status: MessageStatus,
        error: String,
    },
    Notification {
        payload: String,
    },
    StaleReset {
        count: u64,
    },
    RetryReset {
        count: u64,
    },
    Started {
        concurrency: usize,
    },
    Stopped,
    Error {
        message: String,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Thin wrapper around a broadcast sender so callers get a typed
/// `subscribe()` without reaching into `tokio::sync::broadcast` directly.
#[derive(Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event. Errors (no receivers) are intentionally
    /// swallowed — emitting an event is best-effort observability, never
    /// a correctness dependency.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
