//! A durable, transactional message queue built entirely on PostgreSQL row
//! locking and `LISTEN`/`NOTIFY`. A single relational database becomes a
//! multi-producer/multi-consumer queue broker with at-least-once delivery,
//! priority scheduling, retry with exponential backoff, a dead-letter
//! sink, visibility timeouts for crash recovery, and an event-driven
//! consumption loop.
//!
//! The core does not define ordering guarantees stronger than
//! priority-then-FIFO-best-effort within a priority band, does not attempt
//! exactly-once delivery, does not implement fan-out/pub-sub, does not
//! schedule messages at an absolute future time, does not support message
//! updates after enqueue, and does not provide cross-queue transactions.

#![warn(clippy::all)]

pub mod config;
pub mod consumption;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod listener;
pub mod message;
pub mod outbox;
pub mod schema;
pub mod storage;

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

pub use config::{FindOptions, OrderBy, QueueConfig, SortDirection, StartOptions};
pub use consumption::{ConsumptionLoop, FnHandler, Handler};
pub use error::{QueueError, Result};
pub use events::{Event, EventBus};
pub use idempotency::{ExecuteOutcome, IdempotencyStore};
pub use message::{backoff_seconds, is_dead_letter, EnqueueRequest, Message, MessageStatus, QueueStats};
pub use outbox::{OutboxContext, OutboxGateway};
pub use schema::SchemaManager;
pub use storage::StorageAdapter;

/// Top-level facade wiring the storage adapter, schema manager,
/// consumption loop, and event bus together for one queue.
pub struct Queue {
    config: QueueConfig,
    storage: StorageAdapter,
    events: EventBus,
    loop_: Arc<ConsumptionLoop>,
    pool_owned: bool,
}

impl Queue {
    /// Ensure the queue's schema exists, then build the facade bound to
    /// `pool`. `pool_is_owned` should be `true` only when this `Queue`
    /// created the pool itself (see `create_owned_pool`); a caller-handed
    /// pool is never closed by `stop()`.
    pub async fn create(config: QueueConfig, pool: PgPool) -> Result<Self> {
        Self::create_with_ownership(config, pool, false).await
    }

    /// Convenience constructor that opens (and therefore owns) its own
    /// connection pool from a database URL.
    pub async fn create_owned(config: QueueConfig, database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Self::create_with_ownership(config, pool, true).await
    }

    async fn create_with_ownership(config: QueueConfig, pool: PgPool, pool_owned: bool) -> Result<Self> {
        config.validate()?;

        let schema = SchemaManager::new(pool.clone(), &config);
        schema.ensure_table().await?;

        let storage = StorageAdapter::new(pool, &config);
        let events = EventBus::new(1024);
        let loop_ = Arc::new(ConsumptionLoop::new(
            storage.clone(),
            events.clone(),
            &config,
            pool_owned,
        ));

        Ok(Self {
            config,
            storage,
            events,
            loop_,
            pool_owned,
        })
    }

    /// Pure function: returns the schema creation script for `queue_name`
    /// without touching the network.
    pub fn generate_migration(queue_name: &str) -> String {
        SchemaManager::generate_migration(queue_name)
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid> {
        use validator::Validate;
        request.validate().map_err(|e| QueueError::Validation(e.to_string()))?;

        let now = chrono::Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            message_type: request.message_type.clone(),
            payload: request.payload,
            status: MessageStatus::Pending,
            priority: request.priority,
            retry_count: 0,
            max_retries: request.max_retries,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_one(None, &message).await?;
        self.events.emit(Event::Enqueued {
            id: message.id,
            message_type: message.message_type,
            priority: message.priority,
        });
        Ok(message.id)
    }

    /// `work` returns a boxed future borrowing its `OutboxContext` argument
    /// — callers write `|ctx| Box::pin(async move { ... })`. See
    /// `OutboxGateway::with_transaction` for why a plain `Fut` generic
    /// can't express this.
    pub async fn with_transaction<F, T>(&self, work: F) -> Result<T>
    where
        F: for<'c> FnOnce(
            &'c mut OutboxContext<'c>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send + 'c>>,
    {
        OutboxGateway::new(&self.storage, &self.events)
            .with_transaction(work)
            .await
    }

    pub async fn dequeue(&self) -> Result<Option<Message>> {
        self.storage.claim_next().await
    }

    pub async fn ack(&self, id: Uuid) -> Result<()> {
        self.storage.ack(id).await?;
        self.events.emit(Event::Ack { id });
        Ok(())
    }

    pub async fn nack(&self, id: Uuid, error: &str) -> Result<()> {
        let result = self.storage.nack(id, error).await;
        if result.is_ok() {
            if let Some(updated) = self.storage.get(id).await? {
                self.events.emit(Event::Nack {
                    id,
                    retry_count: updated.retry_count,
                    new_status: updated.status,
                    error: error.to_string(),
                });
            }
        }
        result
    }

    pub async fn retry(&self, id: Uuid) -> Result<()> {
        self.storage.manual_retry(id).await
    }

    /// Register a function per message type.
    pub fn register_handler(&self, message_type: impl Into<String>, handler: Arc<dyn Handler>) -> Result<()> {
        self.loop_.register_handler(message_type, handler)
    }

    pub async fn start(&self, opts: StartOptions) -> Result<()> {
        self.loop_.start(opts).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.loop_.stop().await
    }

    pub async fn get_stats(&self) -> Result<QueueStats> {
        self.storage.stats().await
    }

    pub async fn find_by_status(&self, status: MessageStatus, opts: FindOptions) -> Result<Vec<Message>> {
        self.storage.find_by_status(status, opts).await
    }

    pub async fn cleanup_completed(&self, older_than_days: i64) -> Result<u64> {
        self.storage.cleanup_completed(older_than_days).await
    }

    pub async fn cleanup_dead_letters(&self, older_than_days: i64) -> Result<u64> {
        self.storage.cleanup_dead_letters(older_than_days).await
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn pool_is_owned(&self) -> bool {
        self.pool_owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_migration_is_pure_and_network_free() {
        let script = Queue::generate_migration("widgets");
        assert!(script.contains("systeric_pgqueue_widgets"));
    }
}
