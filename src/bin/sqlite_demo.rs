//! Walks through the bridge the way a mobile app would: create tables, add
//! users with an audit trail, hit a unique constraint, list, then clean up.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use rust_sqlite_bridge::logging::init_tracing;
use rust_sqlite_bridge::{Args, Executor, Registry, RegistryConfig, Value};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "sqlite_demo", about = "Exercise the SQLite bridge end to end")]
struct Cli {
    /// Directory for database files (defaults to the system temp dir)
    #[arg(long, env = "SQLITE_DEMO_DIR")]
    dir: Option<PathBuf>,

    /// Database name
    #[arg(long, default_value = "test.db")]
    name: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,

    /// Keep the database file when done
    #[arg(long)]
    keep: bool,
}

const CREATE_USERS: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT UNIQUE NOT NULL,
        age INTEGER,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )";

const CREATE_AUDIT_LOG: &str = "
    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
    )";

async fn add_user(
    exec: &dyn Executor,
    name: &str,
    email: &str,
    age: i64,
) -> rust_sqlite_bridge::Result<i64> {
    let inserted = exec
        .execute(
            "INSERT INTO users (name, email, age) VALUES (?, ?, ?)",
            Args::new().bind(name).bind(email).bind(age),
        )
        .await?;
    exec.execute(
        "INSERT INTO audit_log (action) VALUES (?)",
        Args::new().bind(format!("added user {email}")),
    )
    .await?;
    Ok(inserted.insert_id.unwrap_or_default())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;

    let config = match cli.dir {
        Some(dir) => RegistryConfig::new(dir),
        None => RegistryConfig::default(),
    };
    let registry = Registry::new(config);

    let db = registry.open(&cli.name).await?;
    info!(path = ?db.path(), "Database ready");
    db.execute_sql(CREATE_USERS, ()).await?;
    db.execute_sql(CREATE_AUDIT_LOG, ()).await?;

    let people = [("Alice", "alice@example.com", 30), ("Bob", "bob@example.com", 25)];
    for (name, email, age) in people {
        let id = db
            .transaction(|tx| async move { add_user(&tx, name, email, age).await })
            .await?;
        info!(id, name, "Added user");
    }

    let duplicate = db
        .transaction(|tx| async move {
            add_user(&tx, "Carol", "carol@example.com", 41).await?;
            add_user(&tx, "Mallory", "alice@example.com", 99).await
        })
        .await;
    if let Err(e) = duplicate {
        warn!(error = %e, "Transaction rolled back");
    }

    let users = db
        .execute_sql("SELECT id, name, email, age FROM users ORDER BY id", ())
        .await?;
    println!("{}", serde_json::to_string_pretty(&users)?);

    let audits = db.execute_sql("SELECT COUNT(*) FROM audit_log", ()).await?;
    if let Some(Value::Integer(count)) = audits.scalar() {
        info!(count, "Audit entries");
    }

    registry.close(&cli.name).await?;
    if !cli.keep {
        registry.delete_database(&cli.name).await?;
        info!("Database deleted");
    }
    Ok(())
}
