//! Mercato server error types.

use mercato_core::error::DomainError;
use thiserror::Error;

/// Startup and runtime errors for the server.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Tracing or OpenTelemetry setup failed.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// A write-core component failed to start or stop cleanly.
    #[error("write core error: {0}")]
    Domain(#[from] DomainError),

    /// Signal handling or other I/O error.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = AppError::Config("DATABASE_URL environment variable must be set".to_owned());

        assert_eq!(
            err.to_string(),
            "configuration error: DATABASE_URL environment variable must be set"
        );
    }

    #[test]
    fn test_domain_error_converts() {
        let err: AppError = DomainError::PhysicalCommitFailure("connection reset".to_owned()).into();

        assert!(matches!(err, AppError::Domain(DomainError::PhysicalCommitFailure(_))));
        assert_eq!(
            err.to_string(),
            "write core error: physical commit failed: connection reset"
        );
    }
}
