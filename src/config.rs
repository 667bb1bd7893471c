//! Typed, validated configuration for a queue instance.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{QueueError, Result};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex is valid"));

/// Per-queue configuration, immutable at runtime once a `Queue` is created.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name; resolved into the table identifier `systeric_pgqueue_<name>`.
    pub name: String,
    /// Crash-recovery deadline: how long a row may sit `PROCESSING` before
    /// the stale-reset sweeper reclaims it. Must be > 0.
    pub visibility_timeout: std::time::Duration,
    /// Base interval between sweeper runs. Must be > 0.
    pub sweep_interval: std::time::Duration,
    /// Default `max_retries` applied to messages enqueued without an
    /// explicit override. Must be >= 1.
    pub default_max_retries: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            visibility_timeout: std::time::Duration::from_secs(300),
            sweep_interval: std::time::Duration::from_secs(5),
            default_max_retries: 3,
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration before it is used to derive table and
    /// channel names. Called once at `Queue::create` time.
    pub fn validate(&self) -> Result<()> {
        if !IDENTIFIER_RE.is_match(&self.name) {
            return Err(QueueError::Validation(format!(
                "queue name '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                self.name
            )));
        }
        if self.visibility_timeout.is_zero() {
            return Err(QueueError::Validation(
                "visibility_timeout must be > 0".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(QueueError::Validation(
                "sweep_interval must be > 0".to_string(),
            ));
        }
        if self.default_max_retries < 1 {
            return Err(QueueError::Validation(
                "default_max_retries must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The derived table identifier, e.g. `systeric_pgqueue_orders`.
    pub fn table_name(&self) -> String {
        format!("systeric_pgqueue_{}", self.name)
    }

    /// The derived notification channel, e.g. `systeric_pgqueue_orders_channel`.
    pub fn channel_name(&self) -> String {
        format!("{}_channel", self.table_name())
    }

    /// Layer environment variables prefixed `SYSTERIC_PGQUEUE_` (e.g.
    /// `SYSTERIC_PGQUEUE_VISIBILITY_TIMEOUT_SECS=600`) over the built-in
    /// defaults for `name`. Numeric fields are read in seconds.
    pub fn from_env(name: impl Into<String>) -> Result<Self> {
        let defaults = Self::new(name);
        let settings = config::Config::builder()
            .set_default("visibility_timeout_secs", defaults.visibility_timeout.as_secs())
            .map_err(config_err)?
            .set_default("sweep_interval_secs", defaults.sweep_interval.as_secs())
            .map_err(config_err)?
            .set_default("default_max_retries", defaults.default_max_retries as i64)
            .map_err(config_err)?
            .add_source(config::Environment::with_prefix("SYSTERIC_PGQUEUE"))
            .build()
            .map_err(config_err)?;

        let visibility_timeout_secs: u64 = settings
            .get("visibility_timeout_secs")
            .map_err(config_err)?;
        let sweep_interval_secs: u64 = settings.get("sweep_interval_secs").map_err(config_err)?;
        let default_max_retries: i64 = settings.get("default_max_retries").map_err(config_err)?;

        let resolved = Self {
            name: defaults.name,
            visibility_timeout: std::time::Duration::from_secs(visibility_timeout_secs),
            sweep_interval: std::time::Duration::from_secs(sweep_interval_secs),
            default_max_retries: default_max_retries as i32,
        };
        resolved.validate()?;
        Ok(resolved)
    }
}

fn config_err(e: config::ConfigError) -> QueueError {
    QueueError::Validation(format!("configuration error: {e}"))
}

/// Options passed to `Queue::start`.
#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    /// Number of concurrent "try-consume" workers. Must be >= 1.
    pub concurrency: usize,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Allow-listed sort columns for `find_by_status`. Caller strings are
/// validated against this closed set before any SQL is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    CreatedAt,
    Priority,
}

impl OrderBy {
    pub(crate) fn column(self) -> &'static str {
        match self {
            OrderBy::CreatedAt => "created_at",
            OrderBy::Priority => "priority",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Options passed to `find_by_status`.
#[derive(Debug, Clone, Copy)]
pub struct FindOptions {
    pub limit: i64,
    pub order_by: OrderBy,
    pub order: SortDirection,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            order_by: OrderBy::CreatedAt,
            order: SortDirection::Asc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both paths live in one test: `std::env::set_var` is process-global, and
    // `cargo test` runs tests in parallel threads within the same process,
    // so asserting the unset-default and the override-in-effect cases in
    // two separate tests would race on this variable.
    #[test]
    fn from_env_falls_back_to_defaults_then_honors_override() {
        let defaults = QueueConfig::from_env("orders").unwrap();
        assert_eq!(defaults.name, "orders");
        assert_eq!(defaults.visibility_timeout, std::time::Duration::from_secs(300));
        assert_eq!(defaults.sweep_interval, std::time::Duration::from_secs(5));
        assert_eq!(defaults.default_max_retries, 3);

        std::env::set_var("SYSTERIC_PGQUEUE_DEFAULT_MAX_RETRIES", "7");
        let overridden = QueueConfig::from_env("orders_override");
        std::env::remove_var("SYSTERIC_PGQUEUE_DEFAULT_MAX_RETRIES");
        assert_eq!(overridden.unwrap().default_max_retries, 7);
    }
}
