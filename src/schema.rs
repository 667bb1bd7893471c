//! Schema manager: idempotent creation of a queue's table, supporting
//! indexes, and asynchronous-notification trigger.

use sqlx::PgPool;

use crate::config::QueueConfig;
use crate::error::Result;

pub struct SchemaManager {
    pool: PgPool,
    table: String,
    channel: String,
}

impl SchemaManager {
    pub fn new(pool: PgPool, config: &QueueConfig) -> Self {
        Self {
            pool,
            table: config.table_name(),
            channel: config.channel_name(),
        }
    }

    /// Ensure the queue's table, indexes, and trigger exist. Safe to call
    /// repeatedly on an already-initialized schema. On any failure the
    /// transaction is rolled back and the original error is surfaced.
    pub async fn ensure_table(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(r#"CREATE EXTENSION IF NOT EXISTS "pgcrypto""#)
            .execute(&mut *tx)
            .await?;

        for statement in create_statements(&self.table, &self.channel) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        // Postgres has no `CREATE TRIGGER IF NOT EXISTS`; guard explicitly.
        let trigger = trigger_name(&self.table);
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_trigger WHERE tgname = $1 AND NOT tgisinternal)",
        )
        .bind(&trigger)
        .fetch_one(&mut *tx)
        .await?;

        if !exists {
            sqlx::query(&create_trigger_statement(&self.table))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Pure function returning the complete schema creation script as text,
    /// for callers that prefer to run migrations out-of-band. No I/O.
    pub fn generate_migration(queue_name: &str) -> String {
        let config = QueueConfig::new(queue_name);
        let table = config.table_name();
        let channel = config.channel_name();

        let mut script = String::new();
        script.push_str("CREATE EXTENSION IF NOT EXISTS \"pgcrypto\";\n\n");
        for statement in create_statements(&table, &channel) {
            script.push_str(&statement);
            script.push_str(";\n\n");
        }
        script.push_str(&format!(
            "DO $$ BEGIN \
                IF NOT EXISTS (SELECT 1 FROM pg_trigger WHERE tgname = '{trigger}' AND NOT tgisinternal) THEN \
                    {create_trigger}; \
                END IF; \
             END $$;\n",
            trigger = trigger_name(&table),
            create_trigger = create_trigger_statement(&table).replace(';', "")
        ));
        script
    }
}

fn trigger_name(table: &str) -> String {
    format!("{}_notify_trigger", table)
}

fn function_name(table: &str) -> String {
    format!("{}_notify_fn", table)
}

fn create_statements(table: &str, channel: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} ( \
                id UUID PRIMARY KEY, \
                type TEXT NOT NULL, \
                payload JSONB NOT NULL, \
                status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'dead_letter')), \
                priority INTEGER NOT NULL DEFAULT 5, \
                retry_count INTEGER NOT NULL DEFAULT 0, \
                max_retries INTEGER NOT NULL DEFAULT 3, \
                last_error TEXT, \
                next_retry_at TIMESTAMPTZ, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now() \
            )",
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_claimable_idx ON {table} (priority ASC, created_at ASC) \
             WHERE status = 'pending' OR (status = 'failed' AND next_retry_at IS NOT NULL)",
        ),
        format!("CREATE INDEX IF NOT EXISTS {table}_status_idx ON {table} (status)"),
        format!("CREATE INDEX IF NOT EXISTS {table}_retry_idx ON {table} (status, next_retry_at)"),
        format!("CREATE INDEX IF NOT EXISTS {table}_stale_idx ON {table} (status, updated_at)"),
        format!(
            "CREATE OR REPLACE FUNCTION {func}() RETURNS TRIGGER AS $$ \
             BEGIN \
                IF NEW.status = 'pending' THEN \
                    PERFORM pg_notify('{channel}', NEW.id::text); \
                END IF; \
                RETURN NEW; \
             END; \
             $$ LANGUAGE plpgsql",
            func = function_name(table),
        ),
    ]
}

fn create_trigger_statement(table: &str) -> String {
    format!(
        "CREATE TRIGGER {trigger} AFTER INSERT ON {table} \
         FOR EACH ROW EXECUTE FUNCTION {func}()",
        trigger = trigger_name(table),
        func = function_name(table),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_migration_includes_table_and_trigger() {
        let script = SchemaManager::generate_migration("orders");
        assert!(script.contains("systeric_pgqueue_orders"));
        assert!(script.contains("systeric_pgqueue_orders_channel"));
        assert!(script.contains("pg_notify"));
    }

    #[test]
    fn table_name_collision_across_queues_is_impossible_by_construction() {
        let a = SchemaManager::generate_migration("orders");
        let b = SchemaManager::generate_migration("shipments");
        assert_ne!(a, b);
    }
}
