//! Reusable queries.
//!
//! A [`Query`] wraps an operation written against an [`Executor`]. It holds
//! no connection of its own: each run looks up the transaction bound for its
//! database in the current task and falls back to the top-level executor,
//! so the same query works inside and outside transactions.

use crate::db::backend::Backend;
use crate::db::context;
use crate::db::executor::Executor;
use std::future::Future;
use std::sync::Arc;

/// A reusable database operation.
pub struct Query<B: Backend, F> {
    database_id: u64,
    executor: Executor<B>,
    defn: Arc<F>,
}

impl<B: Backend, F> Clone for Query<B, F> {
    fn clone(&self) -> Self {
        Self {
            database_id: self.database_id,
            executor: self.executor.clone(),
            defn: Arc::clone(&self.defn),
        }
    }
}

impl<B: Backend, F> std::fmt::Debug for Query<B, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("database_id", &self.database_id)
            .field("backend", &B::TYPE)
            .finish_non_exhaustive()
    }
}

impl<B: Backend, F> Query<B, F> {
    pub(crate) fn new(database_id: u64, executor: Executor<B>, defn: F) -> Self {
        Self {
            database_id,
            executor,
            defn: Arc::new(defn),
        }
    }

    /// The executor a run started now would use.
    pub fn resolve(&self) -> Executor<B> {
        context::current::<B>(self.database_id).unwrap_or_else(|| self.executor.clone())
    }

    /// Run the operation with `input`.
    ///
    /// The executor is resolved when the returned future is first polled.
    pub async fn run<I, Fut>(&self, input: I) -> Fut::Output
    where
        F: Fn(Executor<B>, I) -> Fut,
        Fut: Future,
    {
        (self.defn)(self.resolve(), input).await
    }
}
