//! Idempotency store: guarantees a named operation runs at most once per
//! key within a time window, even across process restarts, duplicate
//! deliveries, or concurrent invocations.
//!
//! No direct analog exists elsewhere in this crate for the claim-by-insert
//! protocol below; it is built from the same `sqlx`/transaction idiom used
//! throughout the storage adapter, distinguishing a primary-key violation
//! from any other database error by SQLSTATE rather than string-matching.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{QueueError, Result};

/// Outcome of `execute`: whether this call was the first to claim the key,
/// and the (possibly cached) result.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome<T> {
    pub first: bool,
    pub result: T,
}

pub struct IdempotencyStore {
    pool: PgPool,
    table: String,
}

impl IdempotencyStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Idempotent table creation, following the same `CREATE TABLE IF NOT
    /// EXISTS` shape as the schema manager.
    pub async fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} ( \
                idempotency_key TEXT PRIMARY KEY, \
                result JSONB, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                expires_at TIMESTAMPTZ NOT NULL \
            )",
            table = self.table
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        let idx = format!(
            "CREATE INDEX IF NOT EXISTS {table}_expires_idx ON {table} (expires_at)",
            table = self.table
        );
        sqlx::query(&idx).execute(&self.pool).await?;
        Ok(())
    }

    /// Run `op` at most once per `key` within `ttl`. See module docs for
    /// the full protocol.
    ///
    /// If `op` itself fails, the key stays claimed with `result = NULL`
    /// until `expires_at`: this crate preserves that semantics rather than
    /// guessing at release-on-failure. Callers who want the key to free
    /// immediately on failure should call `invalidate` themselves from
    /// their own error handling.
    pub async fn execute<T, F, Fut>(&self, key: &str, ttl: Duration, op: F) -> Result<ExecuteOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if key.is_empty() || key.len() > 255 {
            return Err(QueueError::Validation(
                "idempotency key must be 1..=255 bytes".to_string(),
            ));
        }

        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let claim_sql = format!(
            "INSERT INTO {table} (idempotency_key, result, expires_at) VALUES ($1, NULL, $2)",
            table = self.table
        );
        let claim = sqlx::query(&claim_sql)
            .bind(key)
            .bind(expires_at)
            .execute(&self.pool)
            .await;

        match claim {
            Ok(_) => self.run_and_record(key, op).await,
            Err(err) if QueueError::is_unique_violation(&err) => self.read_existing(key).await,
            Err(err) => Err(QueueError::ClaimFailure(err)),
        }
    }

    /// Same protocol, but the claim and result write participate in the
    /// caller's transaction, so a rolled-back operation also releases the
    /// claim.
    pub async fn execute_in<T, F, Fut>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        ttl: Duration,
        op: F,
    ) -> Result<ExecuteOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let claim_sql = format!(
            "INSERT INTO {table} (idempotency_key, result, expires_at) VALUES ($1, NULL, $2)",
            table = self.table
        );
        let claim = sqlx::query(&claim_sql)
            .bind(key)
            .bind(expires_at)
            .execute(&mut **tx)
            .await;

        match claim {
            Ok(_) => {
                let result = op().await?;
                let json = serde_json::to_value(&result)?;
                let update_sql = format!(
                    "UPDATE {table} SET result = $2 WHERE idempotency_key = $1",
                    table = self.table
                );
                sqlx::query(&update_sql)
                    .bind(key)
                    .bind(json)
                    .execute(&mut **tx)
                    .await?;
                Ok(ExecuteOutcome { first: true, result })
            }
            Err(err) if QueueError::is_unique_violation(&err) => self.read_existing(key).await,
            Err(err) => Err(QueueError::ClaimFailure(err)),
        }
    }

    async fn run_and_record<T, F, Fut>(&self, key: &str, op: F) -> Result<ExecuteOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = op().await?;
        let json = serde_json::to_value(&result)?;
        let sql = format!(
            "UPDATE {table} SET result = $2 WHERE idempotency_key = $1",
            table = self.table
        );
        sqlx::query(&sql).bind(key).bind(json).execute(&self.pool).await?;
        Ok(ExecuteOutcome { first: true, result })
    }

    async fn read_existing<T>(&self, key: &str) -> Result<ExecuteOutcome<T>>
    where
        T: DeserializeOwned,
    {
        let sql = format!(
            "SELECT result FROM {table} WHERE idempotency_key = $1",
            table = self.table
        );
        let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => Err(QueueError::UniqueConstraint(key.to_string())),
            Some((Some(result),)) => {
                let result = serde_json::from_value(result)?;
                Ok(ExecuteOutcome {
                    first: false,
                    result,
                })
            }
            Some((None,)) => Err(QueueError::InProcess(key.to_string())),
        }
    }

    /// Removes rows with `expires_at <= now`. Returns the count removed.
    pub async fn cleanup(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE expires_at <= now()",
            table = self.table
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Removes a key unconditionally (administrative use).
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM {table} WHERE idempotency_key = $1",
            table = self.table
        );
        sqlx::query(&sql).bind(key).execute(&self.pool).await?;
        Ok(())
    }
}
