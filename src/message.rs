//! Message model: immutable identity and lifecycle state for one queued
//! work item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Lifecycle status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
            MessageStatus::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

/// One queued work item.
///
/// `id`, `message_type`, `priority`, `max_retries`, and `created_at` are
/// write-once after creation — no code path in this crate issues an
/// `UPDATE` that touches those columns.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    #[sqlx(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    pub status: MessageStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated request to enqueue a new message. Priority and max_retries
/// default when omitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EnqueueRequest {
    #[validate(length(min = 1, max = 255))]
    pub message_type: String,
    pub payload: serde_json::Value,
    #[validate(range(min = 1, max = 10))]
    pub priority: i32,
    #[validate(range(min = 1))]
    pub max_retries: i32,
}

impl EnqueueRequest {
    pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            priority: 5,
            max_retries: 3,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// `backoff(k) = min(2^(k-1) seconds, 60 seconds)`, the same formula the
/// storage adapter's `nack` statement computes in SQL. Exposed as a pure
/// function so callers and tests can reason about retry timing without a
/// database.
pub fn backoff_seconds(retry_count: i32) -> i64 {
    let exponent = (retry_count - 1).max(0) as u32;
    2i64.saturating_pow(exponent).min(60)
}

/// Invariant (b): a message is exhausted once `retry_count` exceeds
/// `max_retries`. The storage adapter's `nack` statement encodes this same
/// comparison in its `CASE` expression; this is the canonical Rust-side
/// statement of it, used by the in-memory test double.
pub fn is_dead_letter(retry_count: i32, max_retries: i32) -> bool {
    retry_count > max_retries
}

/// Per-status, per-age snapshot returned by `get_stats`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_letter: i64,
    pub oldest_age_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_pending() {
        assert_eq!(MessageStatus::default(), MessageStatus::Pending);
    }

    #[test]
    fn enqueue_request_rejects_out_of_range_priority() {
        let req = EnqueueRequest::new("t", serde_json::json!({})).with_priority(11);
        assert!(req.validate().is_err());
    }

    #[test]
    fn enqueue_request_accepts_defaults() {
        let req = EnqueueRequest::new("t", serde_json::json!({"x": 1}));
        assert!(req.validate().is_ok());
        assert_eq!(req.priority, 5);
        assert_eq!(req.max_retries, 3);
    }
}
