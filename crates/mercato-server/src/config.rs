//! Server configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use mercato_event_store::batcher::BatcherConfig;
use mercato_outbox::config::PollerConfig;

use crate::error::AppError;

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Pool size.
    pub max_connections: u32,
    /// Write batcher settings.
    pub batcher: BatcherConfig,
    /// Outbox poller settings.
    pub poller: PollerConfig,
    /// OTLP collector endpoint; tracing export is off when unset.
    pub otlp_endpoint: Option<String>,
}

impl AppConfig {
    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `DATABASE_URL` is missing or any
    /// variable does not parse or is out of range.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults
    /// for everything except `DATABASE_URL`.
    ///
    /// # Errors
    ///
    /// Same as [`AppConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let vars = Vars { lookup: &lookup };
        let poller_defaults = PollerConfig::default();
        let batcher_defaults = BatcherConfig::default();

        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                AppError::Config("DATABASE_URL environment variable must be set".to_owned())
            })?;

        let backoff_base: f64 = vars.parse(
            "OUTBOX_BACKOFF_BASE",
            poller_defaults.exponential_backoff_base,
        )?;
        if !backoff_base.is_finite() || backoff_base < 1.0 {
            return Err(AppError::Config(format!(
                "OUTBOX_BACKOFF_BASE must be a number >= 1, got {backoff_base}"
            )));
        }

        let max_retries: i32 = vars.parse("OUTBOX_MAX_RETRIES", poller_defaults.max_retries)?;
        if max_retries < 0 {
            return Err(AppError::Config(format!(
                "OUTBOX_MAX_RETRIES must not be negative, got {max_retries}"
            )));
        }

        Ok(Self {
            database_url,
            max_connections: vars.positive("DATABASE_MAX_CONNECTIONS", 10)?,
            batcher: BatcherConfig {
                flush_interval: vars.millis(
                    "BATCHER_FLUSH_INTERVAL_MS",
                    batcher_defaults.flush_interval,
                )?,
                batch_size_threshold: vars.positive(
                    "BATCHER_SIZE_THRESHOLD",
                    batcher_defaults.batch_size_threshold,
                )?,
                max_queue_depth: vars
                    .positive("BATCHER_MAX_QUEUE_DEPTH", batcher_defaults.max_queue_depth)?,
            },
            poller: PollerConfig {
                poll_interval: vars
                    .millis("OUTBOX_POLL_INTERVAL_MS", poller_defaults.poll_interval)?,
                max_retries,
                exponential_backoff_base: backoff_base,
                batch_size: vars.positive("OUTBOX_BATCH_SIZE", poller_defaults.batch_size)?,
                batch_flush_interval: vars.millis(
                    "OUTBOX_FLUSH_INTERVAL_MS",
                    poller_defaults.batch_flush_interval,
                )?,
                batch_size_threshold: vars.positive(
                    "OUTBOX_FLUSH_THRESHOLD",
                    poller_defaults.batch_size_threshold,
                )?,
                handler_timeout: vars.millis(
                    "OUTBOX_HANDLER_TIMEOUT_MS",
                    poller_defaults.handler_timeout,
                )?,
            },
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
                .filter(|endpoint| !endpoint.trim().is_empty()),
        })
    }
}

struct Vars<'a, L> {
    lookup: &'a L,
}

impl<L: Fn(&str) -> Option<String>> Vars<'_, L> {
    fn parse<T>(&self, name: &str, default: T) -> Result<T, AppError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e| {
                AppError::Config(format!("{name} must be a valid value, got {raw:?}: {e}"))
            }),
        }
    }

    /// Parses a value that must be at least 1.
    fn positive<T>(&self, name: &str, default: T) -> Result<T, AppError>
    where
        T: FromStr + PartialOrd + From<u8> + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(name, default)?;
        if value < T::from(1) {
            return Err(AppError::Config(format!(
                "{name} must be at least 1, got {value}"
            )));
        }
        Ok(value)
    }

    /// Parses a duration given in milliseconds; must be at least 1 ms.
    fn millis(&self, name: &str, default: Duration) -> Result<Duration, AppError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.positive(name, default_ms).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, AppError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_apply_when_only_database_url_is_set() {
        // Act
        let config = config_from(&[("DATABASE_URL", "postgres://localhost/mercato")]).unwrap();

        // Assert
        assert_eq!(config.database_url, "postgres://localhost/mercato");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.batcher.flush_interval, Duration::from_millis(10));
        assert_eq!(config.batcher.batch_size_threshold, 500);
        assert_eq!(config.poller.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.poller.max_retries, 3);
        assert_eq!(config.poller.handler_timeout, Duration::from_secs(30));
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://db/mercato"),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
            ("OUTBOX_MAX_RETRIES", "5"),
            ("OUTBOX_BACKOFF_BASE", "3.5"),
            ("OUTBOX_FLUSH_THRESHOLD", "10"),
            ("BATCHER_MAX_QUEUE_DEPTH", "64"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4317"),
        ])
        .unwrap();

        assert_eq!(config.poller.poll_interval, Duration::from_millis(250));
        assert_eq!(config.poller.max_retries, 5);
        assert!((config.poller.exponential_backoff_base - 3.5).abs() < f64::EPSILON);
        assert_eq!(config.poller.batch_size_threshold, 10);
        assert_eq!(config.batcher.max_queue_depth, 64);
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4317"));
    }

    #[test]
    fn test_missing_database_url_is_a_config_error() {
        let result = config_from(&[]);

        assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("DATABASE_URL")));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let result = config_from(&[
            ("DATABASE_URL", "postgres://db/mercato"),
            ("OUTBOX_FLUSH_INTERVAL_MS", "0"),
        ]);

        assert!(
            matches!(result, Err(AppError::Config(msg)) if msg.contains("OUTBOX_FLUSH_INTERVAL_MS"))
        );
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let result = config_from(&[
            ("DATABASE_URL", "postgres://db/mercato"),
            ("OUTBOX_BATCH_SIZE", "lots"),
        ]);

        assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("OUTBOX_BATCH_SIZE")));
    }

    #[test]
    fn test_backoff_base_below_one_is_rejected() {
        let result = config_from(&[
            ("DATABASE_URL", "postgres://db/mercato"),
            ("OUTBOX_BACKOFF_BASE", "0.5"),
        ]);

        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
