//! Closed error taxonomy shared by every component.

use uuid::Uuid;

/// The closed set of error kinds a queue operation can fail with.
///
/// Every variant carries an immutable code (its discriminant name) and,
/// where the failure has a cause, preserves the cause chain via `#[source]`
/// or `#[from]`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Bad input supplied by the caller: invalid queue name, out-of-range
    /// priority, a malformed order-by/direction pair, etc.
    #[error("validation error: {0}")]
    Validation(String),

    /// Transient I/O or connection failure talking to Postgres.
    #[error("storage fault: {0}")]
    StorageFault(#[source] sqlx::Error),

    /// A transaction failed to commit, or failed to roll back after an
    /// earlier failure (the original error is still what's returned to
    /// the caller; this variant is only used when no prior error exists).
    #[error("transaction error: {0}")]
    Transaction(String),

    /// An expected concurrency outcome: a guarded update matched zero rows
    /// because another actor had already transitioned the row.
    #[error("race lost on message {0}")]
    RaceLost(Uuid),

    /// No row exists for the given identifier.
    #[error("not found: {0}")]
    NotFound(Uuid),

    /// Insert collided with an existing primary key.
    #[error("duplicate id: {0}")]
    DuplicateId(Uuid),

    /// An idempotency key is currently claimed by another in-flight
    /// executor.
    #[error("idempotency key in flight: {0}")]
    InProcess(String),

    /// The idempotency claim insert failed for a reason other than a
    /// uniqueness violation.
    #[error("idempotency claim failed: {0}")]
    ClaimFailure(#[source] sqlx::Error),

    /// The idempotency key vanished (expired and was cleaned up) between
    /// the claim attempt and the follow-up read.
    #[error("idempotency key conflict, retry: {0}")]
    UniqueConstraint(String),

    /// A claimed message's type has no registered handler.
    #[error("no handler registered for type {0}")]
    HandlerMissing(String),

    /// A registered handler returned an error while processing a message.
    #[error("handler failed: {0}")]
    HandlerFailure(String),

    /// A background sweeper run failed.
    #[error("sweep failed: {0}")]
    SweepFailure(String),

    /// JSON (de)serialization failure, folded in as a validation-flavored
    /// failure since it always originates from caller-supplied payloads.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::StorageFault(err)
    }
}

impl QueueError {
    /// `true` if the underlying Postgres error is a primary-key / unique
    /// constraint violation (SQLSTATE `23505`).
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .and_then(|e| e.code())
            .map(|code| code == "23505")
            .unwrap_or(false)
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
