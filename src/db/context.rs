//! Ambient transaction context.
//!
//! While a transaction body runs, its executor is bound in a tokio
//! task-local so that queries invoked anywhere below it (across any number
//! of `.await`s in the same task) pick up the transaction's client. The
//! binding is removed when the scoped future completes or is dropped.
//!
//! Bindings are keyed by database handle and chain to the enclosing scope,
//! so a transaction on one handle can run inside a transaction on another
//! without hiding it. Bindings do not follow `tokio::spawn` unless carried
//! over explicitly, as the transaction bridge does.

use crate::db::backend::Backend;
use crate::db::executor::Executor;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

struct Binding {
    database_id: u64,
    /// Always an `Executor<B>` for the backend of `database_id`.
    executor: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<Binding>>,
}

tokio::task_local! {
    static TRANSACTION_CONTEXT: Arc<Binding>;
}

/// The bindings of one task, captured to be re-installed in another.
#[derive(Clone)]
pub(crate) struct Inherited(Option<Arc<Binding>>);

impl Inherited {
    /// Capture the bindings of the current task.
    pub(crate) fn capture() -> Self {
        Self(TRANSACTION_CONTEXT.try_with(Arc::clone).ok())
    }

    /// Run `body` with `executor` bound for `database_id` on top of the
    /// captured bindings.
    pub(crate) async fn scope<B, F>(self, database_id: u64, executor: Executor<B>, body: F) -> F::Output
    where
        B: Backend,
        F: Future,
    {
        TRANSACTION_CONTEXT
            .scope(bind(database_id, executor, self.0), body)
            .await
    }
}

fn bind<B: Backend>(
    database_id: u64,
    executor: Executor<B>,
    parent: Option<Arc<Binding>>,
) -> Arc<Binding> {
    Arc::new(Binding {
        database_id,
        executor: Arc::new(executor),
        parent,
    })
}

/// Run `body` with `executor` bound as the transaction context of
/// `database_id`.
pub async fn scope<B, F>(database_id: u64, executor: Executor<B>, body: F) -> F::Output
where
    B: Backend,
    F: Future,
{
    Inherited::capture().scope(database_id, executor, body).await
}

/// Synchronous counterpart of [`scope`].
pub fn sync_scope<B, R>(database_id: u64, executor: Executor<B>, body: impl FnOnce() -> R) -> R
where
    B: Backend,
{
    let parent = TRANSACTION_CONTEXT.try_with(Arc::clone).ok();
    TRANSACTION_CONTEXT.sync_scope(bind(database_id, executor, parent), body)
}

/// The innermost transaction executor bound for `database_id`, if any.
pub fn current<B: Backend>(database_id: u64) -> Option<Executor<B>> {
    TRANSACTION_CONTEXT
        .try_with(|binding| {
            let mut cursor = Some(binding);
            while let Some(b) = cursor {
                if b.database_id == database_id {
                    return b.executor.downcast_ref::<Executor<B>>().cloned();
                }
                cursor = b.parent.as_ref();
            }
            None
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::Sqlite;
    use crate::db::executor::TransactionSlot;
    use tokio::sync::Mutex;

    fn tx_executor(id: &str) -> Executor<Sqlite> {
        let slot: TransactionSlot<sqlx::Sqlite> = Arc::new(Mutex::new(None));
        Executor::for_transaction(id.to_string(), slot)
    }

    fn current_id(database_id: u64) -> Option<String> {
        current::<Sqlite>(database_id).and_then(|e| e.transaction_id().map(String::from))
    }

    #[tokio::test]
    async fn test_no_binding_outside_scope() {
        assert!(current::<Sqlite>(1).is_none());
    }

    #[tokio::test]
    async fn test_binding_visible_across_await() {
        let seen = scope(1, tx_executor("tx_a"), async {
            tokio::task::yield_now().await;
            current_id(1)
        })
        .await;
        assert_eq!(seen.as_deref(), Some("tx_a"));
        assert!(current::<Sqlite>(1).is_none());
    }

    #[tokio::test]
    async fn test_binding_removed_after_error() {
        let result: Result<(), &str> = scope(1, tx_executor("tx_a"), async { Err("boom") }).await;
        assert!(result.is_err());
        assert!(current::<Sqlite>(1).is_none());
    }

    #[tokio::test]
    async fn test_inner_binding_shadows_same_database() {
        scope(1, tx_executor("outer"), async {
            let inner = scope(1, tx_executor("inner"), async { current_id(1) }).await;
            assert_eq!(inner.as_deref(), Some("inner"));
            assert_eq!(current_id(1).as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_other_database_binding_stays_visible() {
        scope(1, tx_executor("first"), async {
            scope(2, tx_executor("second"), async {
                assert_eq!(current_id(1).as_deref(), Some("first"));
                assert_eq!(current_id(2).as_deref(), Some("second"));
                assert_eq!(current_id(3), None);
            })
            .await;
        })
        .await;
    }

    #[tokio::test]
    async fn test_binding_not_inherited_by_spawned_task() {
        scope(1, tx_executor("tx_a"), async {
            let spawned = tokio::spawn(async { current_id(1) }).await.unwrap();
            assert_eq!(spawned, None);
        })
        .await;
    }

    #[tokio::test]
    async fn test_inherited_bindings_follow_spawned_task() {
        scope(1, tx_executor("tx_a"), async {
            let inherited = Inherited::capture();
            let spawned = tokio::spawn(inherited.scope(2, tx_executor("tx_b"), async {
                (current_id(1), current_id(2))
            }))
            .await
            .unwrap();
            assert_eq!(spawned.0.as_deref(), Some("tx_a"));
            assert_eq!(spawned.1.as_deref(), Some("tx_b"));
        })
        .await;
    }

    #[test]
    fn test_sync_scope() {
        let seen = sync_scope(7, tx_executor("tx_sync"), || current_id(7));
        assert_eq!(seen.as_deref(), Some("tx_sync"));
        assert_eq!(current_id(7), None);
    }

    #[test]
    fn test_wrong_backend_not_returned() {
        sync_scope(7, tx_executor("tx_sync"), || {
            assert!(current::<crate::db::backend::Postgres>(7).is_none());
        });
    }
}
