//! Transactional database access layer for sqlx.
//!
//! Driver failures are classified into a small error taxonomy, transactions
//! are driven by the outcome of application code, and queries built once are
//! routed to the active transaction of the current task without passing a
//! connection around.

pub mod config;
pub mod db;
pub mod error;

pub use config::{Config, DatabaseConfig};
pub use db::{Backend, Database, DatabaseType, Executor, MySql, Postgres, Query, Sqlite};
pub use error::{DatabaseConnectionLostError, DatabaseError, DatabaseErrorKind, DbError, DbResult, Defect};
