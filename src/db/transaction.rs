//! Transaction bridge.
//!
//! The native primitive ([`run_transaction`]) has the classic driver shape:
//! it opens a transaction, hands it to a single async callback, commits if
//! the callback returns `Ok` and rolls back if it returns `Err`.
//!
//! [`bridge`] drives that primitive with an application body. The primitive
//! runs as its own task on the caller's runtime; the body runs inside the
//! callback with the ambient context installed and its outcome is captured
//! as a tagged [`Exit`]. Anything but success travels back to the caller in
//! the [`Rollback`] marker, so the caller gets the body's own error value
//! (or its panic) rather than a re-wrapped one.
//!
//! The caller keeps the sending half of a one-shot cancellation channel. If
//! the caller's future is dropped, the callback sees the channel close,
//! reports [`Exit::Interrupted`] and the primitive rolls back.

use crate::db::backend::Backend;
use crate::db::context;
use crate::db::executor::{Executor, TransactionSlot};
use crate::error::DbError;
use futures_util::FutureExt;
use sqlx::Pool;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, oneshot};
use tracing::{Instrument, debug, error, info_span, warn};

type PanicPayload = Box<dyn Any + Send + 'static>;

/// Outcome of running a transaction body.
pub(crate) enum Exit<T, E> {
    Success(T),
    /// The body returned `Err`.
    Failure(E),
    /// The body panicked.
    Defect(PanicPayload),
    /// The caller went away before the body finished.
    Interrupted,
}

impl<T, E> Exit<T, E> {
    fn into_result(self) -> Result<T, Rollback<E>> {
        match self {
            Exit::Success(value) => Ok(value),
            Exit::Failure(error) => Err(Rollback::Failure(error)),
            Exit::Defect(payload) => Err(Rollback::Defect(payload)),
            Exit::Interrupted => Err(Rollback::Interrupted),
        }
    }
}

/// Rejection marker: why the callback asked for a rollback.
pub(crate) enum Rollback<E> {
    Failure(E),
    Defect(PanicPayload),
    Interrupted,
}

impl<E> Rollback<E> {
    fn reason(&self) -> &'static str {
        match self {
            Rollback::Failure(_) => "failure",
            Rollback::Defect(_) => "panic",
            Rollback::Interrupted => "interrupted",
        }
    }
}

/// How the native primitive ended when it did not commit.
pub(crate) enum NativeTransactionError<X> {
    /// The callback rejected and the transaction was rolled back.
    RolledBack(X),
    /// The driver failed to begin or commit.
    Driver(sqlx::Error),
    /// The transaction was no longer in its slot when the callback returned.
    Detached,
}

/// Generate a unique transaction ID.
pub(crate) fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Native transaction primitive: commit iff `callback` returns `Ok`.
pub(crate) async fn run_transaction<DB, T, X, F, Fut>(
    pool: &Pool<DB>,
    transaction_id: &str,
    callback: F,
) -> Result<T, NativeTransactionError<X>>
where
    DB: sqlx::Database,
    F: FnOnce(TransactionSlot<DB>) -> Fut,
    Fut: Future<Output = Result<T, X>>,
{
    let tx = pool.begin().await.map_err(NativeTransactionError::Driver)?;
    debug!(transaction_id = %transaction_id, "Transaction started");

    let slot: TransactionSlot<DB> = Arc::new(Mutex::new(Some(tx)));
    let outcome = callback(Arc::clone(&slot)).await;

    let Some(tx) = slot.lock().await.take() else {
        return Err(NativeTransactionError::Detached);
    };

    match outcome {
        Ok(value) => {
            tx.commit().await.map_err(NativeTransactionError::Driver)?;
            debug!(transaction_id = %transaction_id, "Transaction committed");
            Ok(value)
        }
        Err(rejection) => {
            // The rejection is the root cause; a failed rollback only gets logged.
            match tx.rollback().await {
                Ok(()) => debug!(transaction_id = %transaction_id, "Transaction rolled back"),
                Err(e) => error!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "Rollback failed, connection discarded"
                ),
            }
            Err(NativeTransactionError::RolledBack(rejection))
        }
    }
}

/// Callback handed to the native primitive: run `body` in the transaction's
/// context and turn its outcome into commit (`Ok`) or rollback (`Err`).
async fn run_body<B, T, E, F, Fut>(
    inherited: context::Inherited,
    database_id: u64,
    transaction_id: String,
    slot: TransactionSlot<B::Db>,
    body: F,
    cancelled: oneshot::Receiver<()>,
) -> Result<T, Rollback<E>>
where
    B: Backend,
    F: FnOnce(Executor<B>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let executor = Executor::<B>::for_transaction(transaction_id, slot);
    let scoped = inherited.scope(database_id, executor.clone(), async move { body(executor).await });

    let exit = tokio::select! {
        biased;
        outcome = AssertUnwindSafe(scoped).catch_unwind() => match outcome {
            Ok(Ok(value)) => Exit::Success(value),
            Ok(Err(error)) => Exit::Failure(error),
            Err(payload) => Exit::Defect(payload),
        },
        _ = cancelled => Exit::Interrupted,
    };

    exit.into_result().inspect_err(|rollback| {
        warn!(reason = rollback.reason(), "Transaction body did not succeed, rolling back");
    })
}

/// Run `body` as a new native transaction on `pool`.
pub(crate) async fn bridge<B, T, E, F, Fut>(database_id: u64, pool: Pool<B::Db>, body: F) -> Result<T, E>
where
    B: Backend,
    F: FnOnce(Executor<B>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<DbError> + Send + 'static,
{
    let runtime = Handle::try_current()
        .map_err(|_| E::from(DbError::defect("Transactions must run inside a Tokio runtime")))?;

    let transaction_id = generate_transaction_id();
    let span = info_span!("transaction", transaction_id = %transaction_id, backend = %B::TYPE);

    // Dropping `_cancel` (with the caller's future) closes the channel.
    let (_cancel, cancelled) = oneshot::channel::<()>();
    // Transactions on other handles stay visible to the body.
    let inherited = context::Inherited::capture();

    let native = runtime.spawn(
        async move {
            let id = transaction_id.clone();
            run_transaction(&pool, &id, move |slot| {
                run_body::<B, T, E, F, Fut>(inherited, database_id, transaction_id, slot, body, cancelled)
            })
            .await
        }
        .instrument(span),
    );

    match native.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(NativeTransactionError::RolledBack(rollback))) => match rollback {
            Rollback::Failure(error) => Err(error),
            Rollback::Defect(payload) => std::panic::resume_unwind(payload),
            Rollback::Interrupted => Err(E::from(DbError::defect(
                "Transaction body was interrupted",
            ))),
        },
        Ok(Err(NativeTransactionError::Driver(e))) => Err(E::from(B::classify(e))),
        Ok(Err(NativeTransactionError::Detached)) => Err(E::from(DbError::defect(
            "Transaction was detached from its primitive",
        ))),
        Err(join_error) if join_error.is_panic() => std::panic::resume_unwind(join_error.into_panic()),
        Err(_) => Err(E::from(DbError::defect("Transaction task was cancelled"))),
    }
}
