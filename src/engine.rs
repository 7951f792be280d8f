//! Boundary to the embedded SQL engine.
//!
//! The dispatcher for a database is the only code that ever touches an
//! [`EngineHandle`]; everything else talks to it through the request queue.

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sql::{statement_kind, StatementKind};
use crate::value::{Row, StatementResult, Value};

/// Options applied to every handle right after it is opened
#[derive(Debug, Clone, Copy)]
pub struct HandleOptions {
    pub foreign_keys: bool,
    pub busy_timeout: Duration,
}

/// Factory for engine handles plus file management.
pub trait Engine: Send + Sync + 'static {
    /// Open (creating if needed) the database file at `path`.
    fn open_handle(&self, path: &Path, options: HandleOptions) -> Result<Box<dyn EngineHandle>>;

    /// Remove the database file at `path`.
    fn delete_file(&self, path: &Path) -> Result<()>;
}

/// An open engine connection.
pub trait EngineHandle: Send {
    /// Execute one statement with positional arguments.
    fn exec(&mut self, sql: &str, args: &[Value]) -> Result<StatementResult>;

    /// `false` while the engine is inside an explicit transaction.
    fn is_autocommit(&self) -> bool;

    fn close(self: Box<Self>) -> Result<()>;
}

/// rusqlite-backed engine
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteEngine;

impl Engine for SqliteEngine {
    fn open_handle(&self, path: &Path, options: HandleOptions) -> Result<Box<dyn EngineHandle>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let conn = Connection::open(path).map_err(|e| match e {
            rusqlite::Error::SqliteFailure(failure, message) => Error::io(
                path,
                std::io::Error::other(message.unwrap_or_else(|| failure.to_string())),
            ),
            other => Error::from_engine(other),
        })?;

        conn.busy_timeout(options.busy_timeout)
            .map_err(Error::from_engine)?;
        if options.foreign_keys {
            conn.execute_batch("PRAGMA foreign_keys = ON;")
                .map_err(Error::from_engine)?;
        }

        debug!(path = ?path, "Opened SQLite handle");
        Ok(Box::new(SqliteHandle { conn }))
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(|e| Error::io(path, e))?;

        for suffix in ["-journal", "-wal", "-shm"] {
            let mut sidecar = path.as_os_str().to_owned();
            sidecar.push(suffix);
            match std::fs::remove_file(&sidecar) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(sidecar, e)),
            }
        }
        Ok(())
    }
}

struct SqliteHandle {
    conn: Connection,
}

impl EngineHandle for SqliteHandle {
    fn exec(&mut self, sql: &str, args: &[Value]) -> Result<StatementResult> {
        let mut stmt = self.conn.prepare(sql).map_err(Error::from_engine)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let kind = statement_kind(sql);

        let mut rows = Vec::new();
        let mut cursor = stmt
            .query(rusqlite::params_from_iter(args.iter()))
            .map_err(Error::from_engine)?;
        while let Some(row) = cursor.next().map_err(Error::from_engine)? {
            let mut values = Vec::with_capacity(columns.len());
            for (i, column) in columns.iter().enumerate() {
                let value = row.get_ref(i).map_err(Error::from_engine)?;
                values.push((column.clone(), Value::from(value)));
            }
            rows.push(Row::new(values));
        }
        drop(cursor);
        drop(stmt);

        // The engine's change counter only moves for INSERT/UPDATE/DELETE.
        let rows_affected = if kind.is_dml() {
            self.conn.changes()
        } else {
            0
        };
        let insert_id = (kind == StatementKind::Insert && rows_affected > 0)
            .then(|| self.conn.last_insert_rowid());

        Ok(StatementResult {
            rows,
            rows_affected,
            insert_id,
        })
    }

    fn is_autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().map_err(|(_, e)| Error::from_engine(e))
    }
}
