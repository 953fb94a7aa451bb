//! txlayer demo - Main entry point.
//!
//! Runs a small todo workload through the access layer: a migration on the
//! top-level pool, a transaction that creates a todo and reads it back
//! through a query built outside the transaction, and a final listing.

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use txlayer::{
    Config, Database, DatabaseConnectionLostError, DatabaseType, DbError, DbResult, Executor,
    Sqlite,
};

const CREATE_TODOS: &str = "CREATE TABLE IF NOT EXISTS todos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0
)";

#[derive(Debug, sqlx::FromRow)]
struct TodoRow {
    id: i64,
    title: String,
    completed: i64,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, Serialize)]
struct Todo {
    id: i64,
    title: String,
    completed: bool,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<TodoRow> for Todo {
    fn from(row: TodoRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            completed: row.completed != 0,
            created_at: DateTime::from_timestamp_millis(row.created_at),
            updated_at: DateTime::from_timestamp_millis(row.updated_at),
        }
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    ConnectionLost(#[from] DatabaseConnectionLostError),
}

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn migrate(db: &Database<Sqlite>) -> DbResult<()> {
    db.execute(|conn| {
        Box::pin(async move { sqlx::query(CREATE_TODOS).execute(conn).await.map(|_| ()) })
    })
    .await
}

async fn create_todo(executor: Executor<Sqlite>, title: String) -> DbResult<i64> {
    let now = Utc::now().timestamp_millis();
    executor
        .execute(move |conn| {
            Box::pin(async move {
                sqlx::query_scalar(
                    "INSERT INTO todos (title, completed, created_at, updated_at) \
                     VALUES (?, 0, ?, ?) RETURNING id",
                )
                .bind(title)
                .bind(now)
                .bind(now)
                .fetch_one(conn)
                .await
            })
        })
        .await
}

async fn list_todos(executor: Executor<Sqlite>, _: ()) -> DbResult<Vec<Todo>> {
    let rows = executor
        .execute(|conn| {
            Box::pin(async move {
                sqlx::query_as::<_, TodoRow>(
                    "SELECT id, title, completed, created_at, updated_at FROM todos ORDER BY id",
                )
                .fetch_all(conn)
                .await
            })
        })
        .await?;
    Ok(rows.into_iter().map(Todo::from).collect())
}

async fn run(db: &Database<Sqlite>) -> Result<Vec<Todo>, AppError> {
    migrate(db).await?;

    let create = db.make_query(create_todo);
    let list = db.make_query(list_todos);

    let (id, visible) = {
        let (create, list) = (create.clone(), list.clone());
        db.transaction(move |tx| async move {
            let id = create.run("Do something".to_string()).await?;
            let todos = list.run(()).await?;
            debug!(
                transaction_id = tx.transaction_id().unwrap_or_default(),
                todos = todos.len(),
                "Read todos inside transaction"
            );
            Ok::<_, DbError>((id, todos.len()))
        })
        .await?
    };
    info!(todo_id = id, visible_in_transaction = visible, "Todo created");

    Ok(list.run(()).await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let db_config = config.database_config()?;
    if db_config.db_type != DatabaseType::SQLite {
        eprintln!("Error: the demo workload uses SQLite syntax.");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  txlayer-demo --database-url sqlite::memory:");
        eprintln!("  txlayer-demo --database-url sqlite:todos.db?mode=rwc");
        std::process::exit(1);
    }

    info!(
        url = %db_config.url,
        "Starting txlayer demo v{}",
        env!("CARGO_PKG_VERSION")
    );

    let outcome = Database::<Sqlite>::scoped(&db_config, |db| async move {
        tokio::select! {
            result = run(&db) => result,
            Some(lost) = db.connection_lost() => Err(AppError::from(lost)),
        }
    })
    .await?;

    match outcome {
        Ok(todos) => {
            println!("{}", serde_json::to_string_pretty(&todos)?);
            info!(count = todos.len(), "Done");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Demo workload failed");
            Err(e.into())
        }
    }
}
