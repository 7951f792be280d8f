//! Serialized SQLite access and emulated transactions for app bridges.
//!
//! # Intention
//!
//! - Give a UI or native bridge layer `open`, `close`, `execute_sql`,
//!   `transaction` and `delete_database` over named SQLite files.
//! - Make transaction isolation structural: every connection has one
//!   dispatcher, and a transaction holds its queue from BEGIN to COMMIT or
//!   ROLLBACK.
//!
//! # Architectural Boundaries
//!
//! - SQL parsing, planning and storage belong to SQLite.
//! - No UI or bridge plumbing lives here.
//!
//! ```rust,ignore
//! use rust_sqlite_bridge::{Args, Registry, RegistryConfig};
//!
//! let registry = Registry::new(RegistryConfig::new("./data"));
//! let db = registry.open("test.db").await?;
//! db.execute_sql("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", ()).await?;
//! db.transaction(|tx| async move {
//!     tx.execute_sql("INSERT INTO users (name) VALUES (?)", ["Alice"]).await?;
//!     Ok(())
//! })
//! .await?;
//! ```

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod sql;
pub mod transaction;
pub mod value;

pub use config::RegistryConfig;
pub use connection::{Database, Executor};
pub use engine::{Engine, EngineHandle, HandleOptions, SqliteEngine};
pub use error::{ConstraintKind, Error, ErrorKind, Result};
pub use queue::PendingRequest;
pub use registry::Registry;
pub use transaction::{Transaction, TransactionState};
pub use value::{Args, Row, StatementResult, Value};
