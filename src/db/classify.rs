//! Per-engine error classification tables.
//!
//! Each function is pure and total: it inspects a native sqlx failure and
//! returns the recoverable category it belongs to, or `None`.

use crate::error::DatabaseErrorKind;
use sqlx::mysql::MySqlDatabaseError;

/// Failures below the SQL layer, identical for every engine.
fn transport_error_kind(error: &sqlx::Error) -> Option<DatabaseErrorKind> {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            Some(DatabaseErrorKind::ConnectionError)
        }
        _ => None,
    }
}

/// PostgreSQL, keyed by SQLSTATE.
pub fn postgres_error_kind(error: &sqlx::Error) -> Option<DatabaseErrorKind> {
    let sqlx::Error::Database(db_err) = error else {
        return transport_error_kind(error);
    };
    let code = db_err.code()?;
    match code.as_ref() {
        "23505" => Some(DatabaseErrorKind::UniqueViolation),
        "23503" => Some(DatabaseErrorKind::ForeignKeyViolation),
        // too_many_connections
        "53300" => Some(DatabaseErrorKind::ConnectionError),
        // class 08: connection exception
        c if c.starts_with("08") => Some(DatabaseErrorKind::ConnectionError),
        _ => None,
    }
}

/// SQLite, keyed by extended result code.
pub fn sqlite_error_kind(error: &sqlx::Error) -> Option<DatabaseErrorKind> {
    let sqlx::Error::Database(db_err) = error else {
        return transport_error_kind(error);
    };
    let code = db_err.code()?;
    match code.as_ref() {
        // SQLITE_CONSTRAINT_UNIQUE, SQLITE_CONSTRAINT_PRIMARYKEY
        "2067" | "1555" => Some(DatabaseErrorKind::UniqueViolation),
        // SQLITE_CONSTRAINT_FOREIGNKEY
        "787" => Some(DatabaseErrorKind::ForeignKeyViolation),
        // SQLITE_BUSY and its RECOVERY, SNAPSHOT, TIMEOUT variants
        "5" | "261" | "517" | "773" => Some(DatabaseErrorKind::ConnectionError),
        _ => None,
    }
}

/// MySQL / MariaDB, keyed by server error number.
pub fn mysql_error_kind(error: &sqlx::Error) -> Option<DatabaseErrorKind> {
    let sqlx::Error::Database(db_err) = error else {
        return transport_error_kind(error);
    };
    let number = db_err.try_downcast_ref::<MySqlDatabaseError>()?.number();
    mysql_number_kind(number)
}

fn mysql_number_kind(number: u16) -> Option<DatabaseErrorKind> {
    match number {
        // ER_DUP_ENTRY, ER_DUP_ENTRY_WITH_KEY_NAME
        1062 | 1586 => Some(DatabaseErrorKind::UniqueViolation),
        // ER_ROW_IS_REFERENCED_2, ER_NO_REFERENCED_ROW_2
        1451 | 1452 => Some(DatabaseErrorKind::ForeignKeyViolation),
        // ER_CON_COUNT_ERROR, ER_LOCK_WAIT_TIMEOUT
        1040 | 1205 => Some(DatabaseErrorKind::ConnectionError),
        _ => None,
    }
}
