//! Outbox gateway: execute caller-supplied work atomically with one or
//! more enqueues in the same database transaction.

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::events::{Event, EventBus};
use crate::message::{EnqueueRequest, Message, MessageStatus};
use crate::storage::StorageAdapter;

/// Handed to the caller's closure inside `with_transaction`. Exposes raw
/// parameterized query execution and enqueue, both scoped to the same
/// transaction.
pub struct OutboxContext<'a> {
    tx: Transaction<'a, Postgres>,
    storage: &'a StorageAdapter,
    enqueued: Vec<(Uuid, String, i32)>,
}

impl<'a> OutboxContext<'a> {
    /// Execute a raw parameterized statement against the held transaction.
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    /// Enqueue a message as part of this transaction. The trigger-fired
    /// notification is only delivered after the outer transaction commits.
    pub async fn enqueue(&mut self, request: EnqueueRequest) -> Result<Uuid> {
        let now = Utc::now();
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
        self.storage.insert_one(Some(&mut self.tx), &message).await?;
        self.enqueued.push((message.id, message.message_type.clone(), message.priority));
        Ok(message.id)
    }
}

pub struct OutboxGateway<'a> {
    storage: &'a StorageAdapter,
    events: &'a EventBus,
}

impl<'a> OutboxGateway<'a> {
    pub fn new(storage: &'a StorageAdapter, events: &'a EventBus) -> Self {
        Self { storage, events }
    }

    /// Opens a transaction, runs `work` against a context exposing
    /// `execute`/`enqueue`, and commits on success or rolls back on
    /// failure. On a rollback failure, an `error` event is emitted but the
    /// *original* caller error is still what's returned — never masked.
    ///
    /// `work` must return a boxed future, the same shape sqlx's own
    /// `Connection::transaction` requires: the borrow of `ctx` the closure's
    /// future holds is tied to one call (`for<'c>`), which a plain `Fut`
    /// generic parameter cannot express. Callers write
    /// `|ctx| Box::pin(async move { ... })`.
    pub async fn with_transaction<F, T>(&self, work: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut OutboxContext<'c>) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>,
    {
        let tx = self.storage.pool().begin().await?;
        let mut ctx = OutboxContext {
            tx,
            storage: self.storage,
            enqueued: Vec::new(),
        };

        match work(&mut ctx).await {
            Ok(value) => {
                let enqueued = ctx.enqueued.clone();
                ctx.tx.commit().await.map_err(|e| QueueError::Transaction(e.to_string()))?;
                for (id, message_type, priority) in enqueued {
                    self.events.emit(Event::Enqueued {
                        id,
                        message_type,
                        priority,
                    });
                }
                Ok(value)
            }
            Err(original_err) => {
                if let Err(rollback_err) = ctx.tx.rollback().await {
                    self.events.emit(Event::error(format!(
                        "rollback failed: {rollback_err}"
                    )));
                    tracing::error!(error = %rollback_err, "transaction rollback failed");
                }
                Err(original_err)
            }
        }
    }
}
