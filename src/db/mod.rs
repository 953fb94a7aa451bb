//! Database access layer.
//!
//! This module provides:
//! - Backend adapters and their error classifiers
//! - The execution bridge over a pool or an open transaction
//! - The ambient transaction context
//! - The transaction bridge over sqlx's native transactions
//! - Reusable queries that follow the ambient transaction
//! - Pool construction and connection health monitoring

pub mod backend;
pub mod classify;
pub mod context;
pub mod database;
pub mod executor;
pub mod health;
pub mod pool;
pub mod query;
pub(crate) mod transaction;

pub use backend::{Backend, ConnectOptions, Connection, DatabaseType, MySql, Postgres, Sqlite};
pub use database::Database;
pub use executor::Executor;
pub use health::ConnectionState;
pub use query::Query;
