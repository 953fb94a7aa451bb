//! Database handle.
//!
//! A [`Database`] owns one pool and exposes the three operations of the
//! layer: [`execute`](Database::execute) for single driver calls,
//! [`transaction`](Database::transaction) for composite units of work and
//! [`make_query`](Database::make_query) for reusable operations that follow
//! the ambient transaction.

use crate::config::DatabaseConfig;
use crate::db::backend::Backend;
use crate::db::context;
use crate::db::executor::Executor;
use crate::db::health::{self, ConnectionState, StateSender};
use crate::db::pool;
use crate::db::query::Query;
use crate::db::transaction;
use crate::db::{Connection, DatabaseType};
use crate::error::{DatabaseConnectionLostError, DbError, DbResult};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::Pool;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

struct Inner<B: Backend> {
    id: u64,
    pool: Pool<B::Db>,
    top_level: Executor<B>,
    closed: AtomicBool,
    state: StateSender,
    monitor: Option<JoinHandle<()>>,
}

impl<B: Backend> Drop for Inner<B> {
    fn drop(&mut self) {
        if let Some(monitor) = &self.monitor {
            monitor.abort();
        }
    }
}

/// Handle to one database. Cheap to clone; clones share the pool.
pub struct Database<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for Database<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Database<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("db_type", &B::TYPE)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<B: Backend> Database<B> {
    /// Connect using `config`.
    ///
    /// Fails with a [`DatabaseConnectionLostError`] if the database cannot be
    /// reached within `config.connect_timeout`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseConnectionLostError> {
        if config.db_type != B::TYPE {
            return Err(DatabaseConnectionLostError::new(
                format!(
                    "[Database] Failed to connect: {} URL given to a {} handle",
                    config.db_type,
                    B::TYPE
                ),
                None,
            ));
        }
        let pool = pool::connect::<B>(config).await?;
        Ok(Self::new(pool, config.health_check_interval, config.connect_timeout))
    }

    /// Wrap an already-open pool.
    ///
    /// With `health_check_interval` set, a monitor task is started on the
    /// current runtime (if any) and feeds [`connection_lost`](Self::connection_lost).
    pub fn from_pool(pool: Pool<B::Db>, health_check_interval: Option<Duration>) -> Self {
        Self::new(
            pool,
            health_check_interval,
            Duration::from_secs(crate::config::DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    fn new(pool: Pool<B::Db>, health_check_interval: Option<Duration>, ping_timeout: Duration) -> Self {
        let state = health::channel();
        let monitor = match (health_check_interval, tokio::runtime::Handle::try_current()) {
            (Some(interval), Ok(runtime)) => Some(health::spawn(
                &runtime,
                pool.clone(),
                Arc::clone(&state),
                interval,
                ping_timeout,
            )),
            _ => None,
        };
        let id = NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(database_id = id, db_type = %B::TYPE, monitored = monitor.is_some(), "Database handle created");

        Self {
            inner: Arc::new(Inner {
                id,
                top_level: Executor::for_pool(pool.clone()),
                pool,
                closed: AtomicBool::new(false),
                state,
                monitor,
            }),
        }
    }

    /// Connect, run `f`, and close the handle however `f` ends.
    ///
    /// A panic in `f` is resumed after the pool is closed.
    pub async fn scoped<R, F, Fut>(config: &DatabaseConfig, f: F) -> Result<R, DatabaseConnectionLostError>
    where
        F: FnOnce(Database<B>) -> Fut,
        Fut: Future<Output = R>,
    {
        let db = Self::connect(config).await?;
        let outcome = AssertUnwindSafe(f(db.clone())).catch_unwind().await;
        db.close().await;
        match outcome {
            Ok(value) => Ok(value),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Close the pool. Only the first call has any effect.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(monitor) = &self.inner.monitor {
            monitor.abort();
        }
        self.inner.state.send_if_modified(|state| {
            if state.is_connected() {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
        self.inner.pool.close().await;
        info!(database_id = self.inner.id, db_type = %B::TYPE, "Database connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn db_type(&self) -> DatabaseType {
        B::TYPE
    }

    /// The underlying sqlx pool.
    pub fn pool(&self) -> &Pool<B::Db> {
        &self.inner.pool
    }

    /// The top-level executor, bound to the pool.
    pub fn executor(&self) -> Executor<B> {
        self.inner.top_level.clone()
    }

    /// The transaction executor bound in the current task, or the top-level one.
    pub fn current_executor(&self) -> Executor<B> {
        context::current::<B>(self.inner.id).unwrap_or_else(|| self.executor())
    }

    /// Whether a transaction on this handle is bound in the current task.
    pub fn in_transaction(&self) -> bool {
        context::current::<B>(self.inner.id).is_some()
    }

    /// Run a driver call on the top-level pool.
    ///
    /// This never joins an ambient transaction; use a [`Query`] or the
    /// executor handed to a transaction body for that.
    pub async fn execute<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut Connection<B>) -> BoxFuture<'c, Result<T, sqlx::Error>>,
    {
        self.inner.top_level.execute(f).await
    }

    /// Run `body` in a transaction.
    ///
    /// The transaction commits if `body` returns `Ok` and rolls back if it
    /// returns `Err`, panics or is dropped before finishing. The body's own
    /// error is returned unchanged; failures to begin or commit are
    /// classified and converted with `E::from`.
    ///
    /// If a transaction on this handle is already bound in the current task,
    /// `body` joins it instead of opening a new one.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let id = db
    ///     .transaction(move |tx| async move {
    ///         let id = create_todo.run("Do something").await?;
    ///         list_todos.run(()).await?;
    ///         Ok::<_, DbError>(id)
    ///     })
    ///     .await?;
    /// ```
    pub async fn transaction<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(Executor<B>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        if let Some(ambient) = context::current::<B>(self.inner.id) {
            debug!(
                transaction_id = ambient.transaction_id().unwrap_or_default(),
                "Joining ambient transaction"
            );
            return body(ambient).await;
        }
        transaction::bridge::<B, T, E, F, Fut>(self.inner.id, self.inner.pool.clone(), body).await
    }

    /// Build a reusable operation that runs against the ambient transaction
    /// when one is bound, and against the pool otherwise.
    pub fn make_query<F>(&self, defn: F) -> Query<B, F> {
        Query::new(self.inner.id, self.executor(), defn)
    }

    /// Wait until the connection is reported lost.
    ///
    /// Resolves with `None` if the handle is closed first.
    pub async fn connection_lost(&self) -> Option<DatabaseConnectionLostError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx.wait_for(|state| !state.is_connected()).await.ok()?;
        match &*state {
            ConnectionState::Lost(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Current connection state, without waiting.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Report a loss detected by the application.
    ///
    /// Only the first loss is kept; reports after close are ignored.
    pub fn report_connection_lost(&self, error: DatabaseConnectionLostError) {
        if health::report_lost(&self.inner.state, error) {
            if let Some(monitor) = &self.inner.monitor {
                monitor.abort();
            }
        }
    }
}
