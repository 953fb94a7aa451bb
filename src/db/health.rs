//! Connection health monitor.
//!
//! sqlx pools do not report background connection failures, so a monitor
//! task pings the pool on an interval and publishes the first failure on a
//! watch channel. Observers wait on that channel through
//! `Database::connection_lost`.

use crate::error::DatabaseConnectionLostError;
use sqlx::{Connection as _, Pool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, warn};

/// Last known state of a database handle's connection.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Connected,
    Lost(DatabaseConnectionLostError),
    /// The handle was closed before any loss was observed.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

pub(crate) type StateSender = Arc<watch::Sender<ConnectionState>>;

pub(crate) fn channel() -> StateSender {
    Arc::new(watch::Sender::new(ConnectionState::Connected))
}

/// Record a loss unless one was already recorded or the handle closed.
/// Returns whether the state changed.
pub(crate) fn report_lost(state: &StateSender, error: DatabaseConnectionLostError) -> bool {
    state.send_if_modified(|current| {
        if current.is_connected() {
            warn!(error = %error, "Database connection lost");
            *current = ConnectionState::Lost(error);
            true
        } else {
            false
        }
    })
}

/// Acquire and ping one connection, bounded by `limit`.
async fn check<DB: sqlx::Database>(pool: &Pool<DB>, limit: Duration) -> Result<(), DatabaseConnectionLostError> {
    // A saturated pool is serving live connections; an empty one must reconnect.
    let saturated = pool.size() >= pool.options().get_max_connections() && pool.num_idle() == 0;
    if saturated {
        return Ok(());
    }
    let ping = async {
        let mut conn = pool.acquire().await?;
        conn.ping().await
    };
    match timeout(limit, ping).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DatabaseConnectionLostError::new(
            "[Database] Connection check failed",
            Some(e),
        )),
        Err(_) => Err(DatabaseConnectionLostError::new(
            "[Database] Connection check failed: timeout",
            None,
        )),
    }
}

/// Spawn the monitor on `runtime`. It stops after the first reported loss or
/// once the pool closes.
pub(crate) fn spawn<DB: sqlx::Database>(
    runtime: &tokio::runtime::Handle,
    pool: Pool<DB>,
    state: StateSender,
    interval: Duration,
    ping_timeout: Duration,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; connect already verified the pool.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if pool.is_closed() || !state.borrow().is_connected() {
                break;
            }
            match check(&pool, ping_timeout).await {
                Ok(()) => debug!("Connection check passed"),
                Err(error) => {
                    report_lost(&state, error);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> Pool<sqlx::Sqlite> {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    fn test_first_loss_wins() {
        let state = channel();
        assert!(report_lost(
            &state,
            DatabaseConnectionLostError::new("first", None)
        ));
        assert!(!report_lost(
            &state,
            DatabaseConnectionLostError::new("second", None)
        ));
        match &*state.borrow() {
            ConnectionState::Lost(error) => assert_eq!(error.message(), "first"),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_no_loss_after_close() {
        let state = channel();
        state.send_replace(ConnectionState::Closed);
        assert!(!report_lost(&state, DatabaseConnectionLostError::new("late", None)));
        assert!(matches!(*state.borrow(), ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_check_healthy_pool() {
        let pool = memory_pool().await;
        assert!(check(&pool, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_skips_when_pool_busy() {
        let pool = memory_pool().await;
        let _held = pool.acquire().await.unwrap();
        assert!(check(&pool, Duration::from_secs(1)).await.is_ok());
    }

    /// A file-backed pool whose only connection has been taken out of it,
    /// with the database directory removed underneath.
    async fn emptied_pool() -> Pool<sqlx::Sqlite> {
        let dir = tempfile::TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();
        let url = format!("sqlite:{}?mode=rwc", data_dir.join("app.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();

        drop(pool.acquire().await.unwrap().detach());
        assert_eq!(pool.size(), 0);
        std::fs::remove_dir_all(&data_dir).unwrap();
        pool
    }

    #[tokio::test]
    async fn test_check_fails_when_pool_cannot_reconnect() {
        let pool = emptied_pool().await;
        let checked = check(&pool, Duration::from_secs(5)).await;
        let error = checked.unwrap_err();
        assert_eq!(error.message(), "[Database] Connection check failed");
        assert!(error.cause().is_some());
    }

    #[tokio::test]
    async fn test_monitor_reports_loss_of_empty_pool() {
        let pool = emptied_pool().await;
        let state = channel();
        let monitor = spawn(
            &tokio::runtime::Handle::current(),
            pool,
            Arc::clone(&state),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );

        let mut observer = state.subscribe();
        timeout(Duration::from_secs(10), observer.wait_for(|s| !s.is_connected()))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(*state.borrow(), ConnectionState::Lost(_)));
        timeout(Duration::from_secs(5), monitor).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_monitor_stops_when_pool_closes() {
        let pool = memory_pool().await;
        let state = channel();
        let monitor = spawn(
            &tokio::runtime::Handle::current(),
            pool.clone(),
            Arc::clone(&state),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        pool.close().await;
        timeout(Duration::from_secs(5), monitor).await.unwrap().unwrap();
        assert!(state.borrow().is_connected());
    }
}
