//! Error types for the transactional access layer.
//!
//! Failures are split in two tiers. A native failure that a backend
//! recognises becomes a [`DatabaseError`] with one of three kinds; anything
//! else is a [`Defect`] and is never folded into a `DatabaseError`.
//! Connection loss observed outside of a single call is reported separately
//! as [`DatabaseConnectionLostError`].

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Category of a recognised, recoverable database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    /// Busy, exhausted or broken connection.
    ConnectionError,
}

impl DatabaseErrorKind {
    /// Stable tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UniqueViolation => "unique_violation",
            Self::ForeignKeyViolation => "foreign_key_violation",
            Self::ConnectionError => "connection_error",
        }
    }
}

impl std::fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified native failure.
///
/// Only backend classifiers construct these; the original driver error is
/// kept as the source.
#[derive(Error, Debug)]
#[error("DatabaseError ({kind}): {cause}")]
pub struct DatabaseError {
    kind: DatabaseErrorKind,
    #[source]
    cause: sqlx::Error,
}

impl DatabaseError {
    pub(crate) fn new(kind: DatabaseErrorKind, cause: sqlx::Error) -> Self {
        Self { kind, cause }
    }

    pub fn kind(&self) -> DatabaseErrorKind {
        self.kind
    }

    /// The native driver error.
    pub fn cause(&self) -> &sqlx::Error {
        &self.cause
    }

    /// The driver's message, without sqlx's prefix for server errors.
    pub fn message(&self) -> String {
        match &self.cause {
            sqlx::Error::Database(db_err) => db_err.message().to_string(),
            other => other.to_string(),
        }
    }

    pub fn into_cause(self) -> sqlx::Error {
        self.cause
    }
}

/// An unrecognised native failure, or a broken invariant of the layer itself.
///
/// Defects are bugs (malformed SQL, decode mismatches, misuse of a finished
/// transaction) rather than conditions callers are expected to branch on.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct Defect {
    message: String,
    #[source]
    source: Option<sqlx::Error>,
}

impl Defect {
    /// Create a defect that has no underlying driver error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// The driver error this defect was raised for, if any.
    pub fn native(&self) -> Option<&sqlx::Error> {
        self.source.as_ref()
    }
}

impl From<sqlx::Error> for Defect {
    fn from(err: sqlx::Error) -> Self {
        Self {
            message: format!("Unrecognized database failure: {}", err),
            source: Some(err),
        }
    }
}

/// Error returned by `execute`, queries, and the transaction bridge.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Defect: {0}")]
    Defect(#[from] Defect),
}

impl DbError {
    /// Create a defect error with no driver cause.
    pub fn defect(message: impl Into<String>) -> Self {
        Self::Defect(Defect::new(message))
    }

    /// The classified kind, or `None` for defects.
    pub fn kind(&self) -> Option<DatabaseErrorKind> {
        match self {
            Self::Database(err) => Some(err.kind()),
            Self::Defect(_) => None,
        }
    }

    pub fn is_defect(&self) -> bool {
        matches!(self, Self::Defect(_))
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind() == Some(DatabaseErrorKind::ConnectionError)
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// The connection was lost or could not be established.
///
/// Raised by `Database::connect` and by the background health monitor,
/// never by a single statement.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct DatabaseConnectionLostError {
    message: String,
    #[source]
    cause: Option<Arc<sqlx::Error>>,
}

impl DatabaseConnectionLostError {
    pub fn new(message: impl Into<String>, cause: Option<sqlx::Error>) -> Self {
        Self {
            message: message.into(),
            cause: cause.map(Arc::new),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&sqlx::Error> {
        self.cause.as_deref()
    }
}

/// Invalid configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unknown database type in connection string: {0}")]
    UnknownDatabaseType(String),

    #[error("Invalid value for '{key}': {value}")]
    InvalidOption { key: String, value: String },

    #[error("Invalid pool options: {0}")]
    InvalidPoolOptions(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(DatabaseErrorKind::UniqueViolation.to_string(), "unique_violation");
        assert_eq!(
            DatabaseErrorKind::ForeignKeyViolation.to_string(),
            "foreign_key_violation"
        );
        assert_eq!(DatabaseErrorKind::ConnectionError.to_string(), "connection_error");
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&DatabaseErrorKind::ForeignKeyViolation).unwrap();
        assert_eq!(json, "\"foreign_key_violation\"");
    }

    #[test]
    fn test_database_error_keeps_cause() {
        let err = DatabaseError::new(DatabaseErrorKind::ConnectionError, sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), DatabaseErrorKind::ConnectionError);
        assert!(matches!(err.cause(), sqlx::Error::PoolTimedOut));
        assert!(err.to_string().contains("connection_error"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_defect_from_native_error() {
        let defect = Defect::from(sqlx::Error::RowNotFound);
        assert!(defect.native().is_some());
        assert!(defect.to_string().contains("Unrecognized database failure"));
    }

    #[test]
    fn test_db_error_accessors() {
        let err = DbError::from(DatabaseError::new(
            DatabaseErrorKind::ConnectionError,
            sqlx::Error::PoolClosed,
        ));
        assert_eq!(err.kind(), Some(DatabaseErrorKind::ConnectionError));
        assert!(err.is_retryable());
        assert!(!err.is_defect());

        let err = DbError::defect("transaction already finished");
        assert_eq!(err.kind(), None);
        assert!(err.is_defect());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unique_violation_not_retryable() {
        let err = DbError::from(DatabaseError::new(
            DatabaseErrorKind::UniqueViolation,
            sqlx::Error::RowNotFound,
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_connection_lost_is_clone() {
        let err = DatabaseConnectionLostError::new(
            "[Database] Failed to connect: timeout",
            Some(sqlx::Error::PoolTimedOut),
        );
        let copy = err.clone();
        assert_eq!(copy.message(), "[Database] Failed to connect: timeout");
        assert!(copy.cause().is_some());
    }
}
