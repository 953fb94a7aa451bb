//! Backend adapters.
//!
//! A backend is a thin adapter around one sqlx driver: it names the driver's
//! `Database` type, tunes its connect options and classifies its native
//! errors. Everything else (execution, transactions, ambient routing) is
//! shared.

use crate::config::DatabaseConfig;
use crate::db::classify;
use crate::error::{DatabaseError, DatabaseErrorKind, DbError, Defect};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// The driver connection a backend's calls run against.
pub type Connection<B> = <<B as Backend>::Db as sqlx::Database>::Connection;

/// The driver's connect options for a backend.
pub type ConnectOptions<B> = <Connection<B> as sqlx::Connection>::Options;

/// One database engine.
pub trait Backend: Send + Sync + 'static {
    /// The sqlx driver.
    type Db: sqlx::Database;

    const TYPE: DatabaseType;

    /// Map a native failure to a recoverable category.
    ///
    /// `None` means the failure is not a known condition and must surface
    /// as a defect.
    fn error_kind(error: &sqlx::Error) -> Option<DatabaseErrorKind>;

    /// Adjust parsed connect options before the pool is built.
    fn configure(options: ConnectOptions<Self>, _config: &DatabaseConfig) -> ConnectOptions<Self> {
        options
    }

    /// Apply the two-tier rule to a native failure.
    fn classify(error: sqlx::Error) -> DbError {
        match Self::error_kind(&error) {
            Some(kind) => {
                debug!(backend = %Self::TYPE, kind = %kind, error = %error, "Classified database failure");
                DbError::Database(DatabaseError::new(kind, error))
            }
            None => {
                error!(backend = %Self::TYPE, error = %error, "Unrecognized database failure");
                DbError::Defect(Defect::from(error))
            }
        }
    }
}

/// PostgreSQL backend.
#[derive(Debug, Clone, Copy)]
pub struct Postgres;

impl Backend for Postgres {
    type Db = sqlx::Postgres;

    const TYPE: DatabaseType = DatabaseType::PostgreSQL;

    fn error_kind(error: &sqlx::Error) -> Option<DatabaseErrorKind> {
        classify::postgres_error_kind(error)
    }
}

/// MySQL / MariaDB backend.
#[derive(Debug, Clone, Copy)]
pub struct MySql;

impl Backend for MySql {
    type Db = sqlx::MySql;

    const TYPE: DatabaseType = DatabaseType::MySQL;

    fn error_kind(error: &sqlx::Error) -> Option<DatabaseErrorKind> {
        classify::mysql_error_kind(error)
    }

    fn configure(options: ConnectOptions<Self>, _config: &DatabaseConfig) -> ConnectOptions<Self> {
        options.charset("utf8mb4")
    }
}

/// SQLite backend.
#[derive(Debug, Clone, Copy)]
pub struct Sqlite;

impl Backend for Sqlite {
    type Db = sqlx::Sqlite;

    const TYPE: DatabaseType = DatabaseType::SQLite;

    fn error_kind(error: &sqlx::Error) -> Option<DatabaseErrorKind> {
        classify::sqlite_error_kind(error)
    }

    fn configure(options: ConnectOptions<Self>, _config: &DatabaseConfig) -> ConnectOptions<Self> {
        options.create_if_missing(true).foreign_keys(true)
    }
}
