//! Storage adapter: owns one queue's table and exposes the primitive
//! operations over it. "Claim next" is the only operation where multiple
//! actors contend; its correctness relies on ordered selection, an
//! exclusive row lock, skip-locked semantics, and a commit-visible status
//! transition.

use std::time::Duration;

use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::{FindOptions, QueueConfig};
use crate::error::{QueueError, Result};
use crate::message::{Message, MessageStatus, QueueStats};

/// Bound to one queue's table/channel names and connection pool.
#[derive(Clone)]
pub struct StorageAdapter {
    pool: PgPool,
    table: String,
}

impl StorageAdapter {
    pub fn new(pool: PgPool, config: &QueueConfig) -> Self {
        Self {
            pool,
            table: config.table_name(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a fully-formed message. If `tx` is provided, the insert
    /// participates in the caller's transaction (the substrate for the
    /// outbox pattern); the row — and the trigger-fired notification —
    /// become durable only when that outer transaction commits.
    pub async fn insert_one(
        &self,
        tx: Option<&mut Transaction<'_, Postgres>>,
        message: &Message,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} \
             (id, type, payload, status, priority, retry_count, max_retries, \
              last_error, next_retry_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            table = self.table
        );
        let query = sqlx::query(&sql)
            .bind(message.id)
            .bind(&message.message_type)
            .bind(&message.payload)
            .bind(message.status)
            .bind(message.priority)
            .bind(message.retry_count)
            .bind(message.max_retries)
            .bind(&message.last_error)
            .bind(message.next_retry_at)
            .bind(message.created_at)
            .bind(message.updated_at);

        let result = match tx {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&self.pool).await,
        };

        match result {
            Ok(_) => Ok(()),
            Err(err) if QueueError::is_unique_violation(&err) => {
                Err(QueueError::DuplicateId(message.id))
            }
            Err(err) => Err(QueueError::StorageFault(err)),
        }
    }

    /// Atomically claim the single highest-priority claimable row, skipping
    /// rows already locked by other sessions. Work-stealing: N concurrent
    /// callers receive N distinct rows without serializing.
    pub async fn claim_next(&self) -> Result<Option<Message>> {
        let sql = format!(
            "WITH claimed AS ( \
                SELECT id FROM {table} \
                WHERE status = 'pending' \
                ORDER BY priority ASC, created_at ASC \
                LIMIT 1 \
                FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE {table} m \
             SET status = 'processing', updated_at = now() \
             FROM claimed c \
             WHERE m.id = c.id \
             RETURNING m.id, m.type, m.payload, m.status, m.priority, \
                       m.retry_count, m.max_retries, m.last_error, \
                       m.next_retry_at, m.created_at, m.updated_at",
            table = self.table
        );
        let row = sqlx::query_as::<_, Message>(&sql)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Transition `PROCESSING -> COMPLETED`. A concurrent sweeper may have
    /// already reset the row to `PENDING`; that race is not an error — the
    /// message will simply be reprocessed, which at-least-once allows.
    pub async fn ack(&self, id: Uuid) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET status = 'completed', updated_at = now() \
             WHERE id = $1 AND status = 'processing'",
            table = self.table
        );
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Increment `retry_count`; transition to `DEAD_LETTER` if the budget is
    /// exhausted, else to `FAILED` with `next_retry_at = now + backoff(retry_count)`.
    /// Guarded by `WHERE status = 'processing'`; zero matched rows means the
    /// row was already reclaimed, and is reported as `RaceLost` so the
    /// caller may log and proceed.
    ///
    /// The `retry_count + 1 > max_retries` branch here is `nack`'s side of
    /// invariant (b); `crate::message::is_dead_letter` states the same
    /// comparison for the in-memory double and tests.
    pub async fn nack(&self, id: Uuid, error: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET \
                retry_count = retry_count + 1, \
                last_error = $2, \
                status = CASE WHEN retry_count + 1 > max_retries THEN 'dead_letter' ELSE 'failed' END, \
                next_retry_at = CASE WHEN retry_count + 1 > max_retries THEN NULL \
                    ELSE now() + (LEAST(POWER(2, retry_count), 60) * INTERVAL '1 second') END, \
                updated_at = now() \
             WHERE id = $1 AND status = 'processing'",
            table = self.table
        );
        let result = sqlx::query(&sql).bind(id).bind(error).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::RaceLost(id));
        }
        Ok(())
    }

    /// Point read by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Message>> {
        let sql = format!("SELECT * FROM {table} WHERE id = $1", table = self.table);
        let row = sqlx::query_as::<_, Message>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Query by status with validated order-by/direction (closed allow-lists
    /// enforced in `FindOptions`, never caller-supplied strings spliced
    /// directly into SQL).
    pub async fn find_by_status(
        &self,
        status: MessageStatus,
        opts: FindOptions,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT * FROM {table} WHERE status = $1 ORDER BY {col} {dir} LIMIT $2",
            table = self.table,
            col = opts.order_by.column(),
            dir = opts.order.sql(),
        );
        let rows = sqlx::query_as::<_, Message>(&sql)
            .bind(status)
            .bind(opts.limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// One aggregation query returning per-status counts and the age (ms)
    /// of the oldest row.
    pub async fn stats(&self) -> Result<QueueStats> {
        let sql = format!(
            "SELECT \
                COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                COUNT(*) FILTER (WHERE status = 'processing') AS processing, \
                COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
                COUNT(*) FILTER (WHERE status = 'dead_letter') AS dead_letter, \
                COALESCE(EXTRACT(EPOCH FROM (now() - MIN(created_at))) * 1000, 0)::BIGINT AS oldest_age_ms \
             FROM {table}",
            table = self.table
        );
        let row: (i64, i64, i64, i64, i64, i64) =
            sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(QueueStats {
            pending: row.0,
            processing: row.1,
            completed: row.2,
            failed: row.3,
            dead_letter: row.4,
            oldest_age_ms: row.5,
        })
    }

    /// Crash-recovery primitive: reset `PROCESSING` rows whose `updated_at`
    /// predates `now - timeout` back to `PENDING`. Returns the count reset.
    pub async fn reset_stale(&self, timeout: Duration) -> Result<u64> {
        let sql = format!(
            "UPDATE {table} SET status = 'pending', updated_at = now() \
             WHERE status = 'processing' AND updated_at < now() - ($1 * INTERVAL '1 millisecond')",
            table = self.table
        );
        let result = sqlx::query(&sql)
            .bind(timeout.as_millis() as f64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Promote `FAILED` rows whose `next_retry_at <= now` back to `PENDING`,
    /// clearing `next_retry_at`. Returns the count promoted.
    pub async fn promote_retries(&self) -> Result<u64> {
        let sql = format!(
            "UPDATE {table} SET status = 'pending', next_retry_at = NULL, updated_at = now() \
             WHERE status = 'failed' AND next_retry_at <= now()",
            table = self.table
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Regardless of prior status (including `DEAD_LETTER`), reset to
    /// `PENDING` and clear `retry_count`/`last_error`/`next_retry_at`.
    pub async fn manual_retry(&self, id: Uuid) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET status = 'pending', retry_count = 0, \
             last_error = NULL, next_retry_at = NULL, updated_at = now() \
             WHERE id = $1",
            table = self.table
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    pub async fn cleanup_completed(&self, older_than_days: i64) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE status = 'completed' AND updated_at < now() - ($1 * INTERVAL '1 day')",
            table = self.table
        );
        let result = sqlx::query(&sql)
            .bind(older_than_days)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn cleanup_dead_letters(&self, older_than_days: i64) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE status = 'dead_letter' AND updated_at < now() - ($1 * INTERVAL '1 day')",
            table = self.table
        );
        let result = sqlx::query(&sql)
            .bind(older_than_days)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// In-process test double used by consumption-loop tests that don't need
/// a live database. Implements the same primitive operations against a
/// locked `HashMap` instead of Postgres; used only under `#[cfg(test)]`.
#[cfg(test)]
pub(crate) mod in_memory {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    #[derive(Default)]
    pub(crate) struct InMemoryStorage {
        rows: RwLock<HashMap<Uuid, Message>>,
    }

    impl InMemoryStorage {
        pub(crate) fn insert(&self, message: Message) {
            self.rows.write().insert(message.id, message);
        }

        pub(crate) fn claim_next(&self) -> Option<Message> {
            let mut rows = self.rows.write();
            let candidate = rows
                .values()
                .filter(|m| m.status == MessageStatus::Pending)
                .min_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .map(|m| m.id)?;
            let row = rows.get_mut(&candidate)?;
            row.status = MessageStatus::Processing;
            row.updated_at = Utc::now();
            Some(row.clone())
        }

        pub(crate) fn ack(&self, id: Uuid) {
            let mut rows = self.rows.write();
            if let Some(row) = rows.get_mut(&id) {
                if row.status == MessageStatus::Processing {
                    row.status = MessageStatus::Completed;
                    row.updated_at = Utc::now();
                }
            }
        }

        pub(crate) fn nack(&self, id: Uuid, error: &str) -> bool {
            let mut rows = self.rows.write();
            let Some(row) = rows.get_mut(&id) else {
                return false;
            };
            if row.status != MessageStatus::Processing {
                return false;
            }
            row.retry_count += 1;
            row.last_error = Some(error.to_string());
            if crate::message::is_dead_letter(row.retry_count, row.max_retries) {
                row.status = MessageStatus::DeadLetter;
                row.next_retry_at = None;
            } else {
                row.status = MessageStatus::Failed;
                let backoff_secs = crate::message::backoff_seconds(row.retry_count);
                row.next_retry_at = Some(Utc::now() + chrono::Duration::seconds(backoff_secs));
            }
            row.updated_at = Utc::now();
            true
        }

        pub(crate) fn get(&self, id: Uuid) -> Option<Message> {
            self.rows.read().get(&id).cloned()
        }

        #[cfg(test)]
        pub(crate) fn force_status(&self, id: Uuid, status: MessageStatus) {
            if let Some(row) = self.rows.write().get_mut(&id) {
                row.status = status;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::in_memory::InMemoryStorage;
    use crate::message::{Message, MessageStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn make_message(priority: i32) -> Message {
        Message {
            id: Uuid::new_v4(),
            message_type: "t".to_string(),
            payload: serde_json::json!({}),
            status: MessageStatus::Pending,
            priority,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            next_retry_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn claim_next_respects_priority_ascending() {
        let storage = InMemoryStorage::default();
        let low = make_message(5);
        let high = make_message(1);
        storage.insert(low.clone());
        storage.insert(high.clone());

        let claimed = storage.claim_next().expect("one claimable row");
        assert_eq!(claimed.id, high.id);
    }

    #[test]
    fn nack_past_max_retries_goes_dead_letter() {
        let storage = InMemoryStorage::default();
        let mut msg = make_message(5);
        msg.max_retries = 1;
        storage.insert(msg.clone());
        storage.claim_next();

        assert!(storage.nack(msg.id, "boom"));
        let after_first = storage.get(msg.id).unwrap();
        assert_eq!(after_first.status, MessageStatus::Failed);

        // Re-claim after the (simulated) retry promotion, then fail again.
        storage.force_status(msg.id, MessageStatus::Processing);

        assert!(storage.nack(msg.id, "boom again"));
        let after_second = storage.get(msg.id).unwrap();
        assert_eq!(after_second.status, MessageStatus::DeadLetter);
        assert!(after_second.next_retry_at.is_none());
    }

    #[test]
    fn ack_on_missing_row_is_silent() {
        let storage = InMemoryStorage::default();
        storage.ack(Uuid::new_v4());
    }
}
