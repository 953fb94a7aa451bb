//! Execution bridge.
//!
//! An [`Executor`] is bound to one client: either the top-level pool or an
//! open transaction. Both hand the driver call the same
//! `&mut Connection<B>`, so a driver call cannot tell which one it got.
//! Failures are classified by the backend exactly once, here.

use crate::db::backend::{Backend, Connection};
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use sqlx::{Pool, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;

/// An open native transaction, shared between the transaction primitive and
/// the executors bound to it. The primitive takes it back out to commit or
/// roll back, after which the slot stays empty.
pub(crate) type TransactionSlot<DB> = Arc<Mutex<Option<Transaction<'static, DB>>>>;

enum Target<B: Backend> {
    Pool(Pool<B::Db>),
    Transaction {
        transaction_id: String,
        slot: TransactionSlot<B::Db>,
    },
}

/// Runs driver calls against a bound client, classifying failures.
pub struct Executor<B: Backend> {
    target: Arc<Target<B>>,
}

impl<B: Backend> Clone for Executor<B> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Executor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target.as_ref() {
            Target::Pool(_) => f
                .debug_struct("Executor")
                .field("backend", &B::TYPE)
                .field("target", &"pool")
                .finish(),
            Target::Transaction { transaction_id, .. } => f
                .debug_struct("Executor")
                .field("backend", &B::TYPE)
                .field("transaction_id", transaction_id)
                .finish(),
        }
    }
}

impl<B: Backend> Executor<B> {
    pub(crate) fn for_pool(pool: Pool<B::Db>) -> Self {
        Self {
            target: Arc::new(Target::Pool(pool)),
        }
    }

    pub(crate) fn for_transaction(transaction_id: String, slot: TransactionSlot<B::Db>) -> Self {
        Self {
            target: Arc::new(Target::Transaction {
                transaction_id,
                slot,
            }),
        }
    }

    /// Whether this executor is bound to an open transaction.
    pub fn is_transaction(&self) -> bool {
        matches!(self.target.as_ref(), Target::Transaction { .. })
    }

    /// Identifier of the bound transaction, `None` for the pool.
    pub fn transaction_id(&self) -> Option<&str> {
        match self.target.as_ref() {
            Target::Pool(_) => None,
            Target::Transaction { transaction_id, .. } => Some(transaction_id),
        }
    }

    /// Run a driver call against the bound client.
    ///
    /// For the pool a connection is acquired for the duration of the call.
    /// For a transaction the call holds the transaction's connection
    /// exclusively, so concurrent calls on one transaction run one at a time.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let rows = executor
    ///     .execute(|conn| {
    ///         Box::pin(async move {
    ///             sqlx::query("SELECT id FROM todos").fetch_all(conn).await
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut Connection<B>) -> BoxFuture<'c, Result<T, sqlx::Error>>,
    {
        match self.target.as_ref() {
            Target::Pool(pool) => {
                let mut conn = pool.acquire().await.map_err(B::classify)?;
                f(&mut *conn).await.map_err(B::classify)
            }
            Target::Transaction {
                transaction_id,
                slot,
            } => {
                let mut guard = slot.lock().await;
                let tx = guard.as_mut().ok_or_else(|| {
                    DbError::defect(format!(
                        "Transaction {} used after it finished",
                        transaction_id
                    ))
                })?;
                f(&mut **tx).await.map_err(B::classify)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::Sqlite;
    use crate::error::DatabaseErrorKind;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> Pool<sqlx::Sqlite> {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pool_executor_runs_call() {
        let executor = Executor::<Sqlite>::for_pool(memory_pool().await);
        assert!(!executor.is_transaction());
        assert_eq!(executor.transaction_id(), None);

        let value: i64 = executor
            .execute(|conn| {
                Box::pin(async move { sqlx::query_scalar("SELECT 40 + 2").fetch_one(conn).await })
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_unrecognized_failure_is_defect() {
        let executor = Executor::<Sqlite>::for_pool(memory_pool().await);
        let err = executor
            .execute(|conn| {
                Box::pin(async move { sqlx::query("SELEC nonsense").execute(conn).await })
            })
            .await
            .unwrap_err();
        assert!(err.is_defect());
    }

    #[tokio::test]
    async fn test_closed_pool_is_connection_error() {
        let pool = memory_pool().await;
        pool.close().await;
        let executor = Executor::<Sqlite>::for_pool(pool);
        let err = executor
            .execute(|conn| Box::pin(async move { sqlx::query("SELECT 1").execute(conn).await }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(DatabaseErrorKind::ConnectionError));
    }

    #[tokio::test]
    async fn test_finished_transaction_is_defect() {
        let slot: TransactionSlot<sqlx::Sqlite> = Arc::new(Mutex::new(None));
        let executor = Executor::<Sqlite>::for_transaction("tx_finished".to_string(), slot);
        assert!(executor.is_transaction());
        assert_eq!(executor.transaction_id(), Some("tx_finished"));

        let err = executor
            .execute(|conn| Box::pin(async move { sqlx::query("SELECT 1").execute(conn).await }))
            .await
            .unwrap_err();
        assert!(err.is_defect());
        assert!(err.to_string().contains("tx_finished"));
    }
}
