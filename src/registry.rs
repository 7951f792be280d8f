//! Process-owned registry of open databases.
//!
//! Create one at startup and hand it to whoever needs database access.
//! Dropping it (and every [`Database`] clone) closes all handles.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;

use crate::config::RegistryConfig;
use crate::connection::Database;
use crate::engine::{Engine, HandleOptions, SqliteEngine};
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::value::{Args, StatementResult};

enum Slot {
    Opening,
    Open(Database),
    Deleting,
}

type Slots = Mutex<HashMap<PathBuf, Slot>>;

/// Drop the entry for `path` if it still belongs to handle `id`.
fn release(databases: &Slots, path: &Path, id: u64) {
    let mut databases = databases.lock();
    if matches!(databases.get(path), Some(Slot::Open(db)) if db.id() == id) {
        databases.remove(path);
    }
}

pub struct Registry {
    config: RegistryConfig,
    engine: Arc<dyn Engine>,
    databases: Arc<Slots>,
}

/// Releases a name reserved by `open` or `delete_database` unless the
/// reservation is taken over.
struct Reservation {
    databases: Arc<Slots>,
    path: Option<PathBuf>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            self.databases.lock().remove(&path);
        }
    }
}

impl Registry {
    /// Registry backed by SQLite
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_engine(config, Arc::new(SqliteEngine))
    }

    pub fn with_engine(config: RegistryConfig, engine: Arc<dyn Engine>) -> Self {
        Self {
            config,
            engine,
            databases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Open `name`, creating its file if needed.
    pub async fn open(&self, name: &str) -> Result<Database> {
        let path = self.config.database_path(name)?;
        {
            let mut databases = self.databases.lock();
            match databases.get(&path) {
                Some(Slot::Deleting) => {
                    return Err(Error::io(
                        &path,
                        std::io::Error::other("database is being deleted"),
                    ))
                }
                Some(_) => {
                    return Err(Error::AlreadyOpen {
                        name: name.to_string(),
                    })
                }
                None => {}
            }
            databases.insert(path.clone(), Slot::Opening);
        }
        let mut reservation = Reservation {
            databases: self.databases.clone(),
            path: Some(path.clone()),
        };

        let options = HandleOptions {
            foreign_keys: self.config.foreign_keys,
            busy_timeout: self.config.busy_timeout(),
        };
        let slots: Weak<Slots> = Arc::downgrade(&self.databases);
        let released_path = path.clone();
        let on_closed: Box<dyn FnOnce(u64) + Send> = Box::new(move |id| {
            if let Some(databases) = slots.upgrade() {
                release(&databases, &released_path, id);
            }
        });
        let db = Database::open(
            name,
            path.clone(),
            self.engine.clone(),
            options,
            self.config.request_timeout(),
            Some(on_closed),
        )
        .await?;

        reservation.path = None;
        self.databases.lock().insert(path, Slot::Open(db.clone()));
        Ok(db)
    }

    /// The open handle for `name`.
    pub fn get(&self, name: &str) -> Result<Database> {
        let path = self.config.database_path(name)?;
        match self.databases.lock().get(&path) {
            Some(Slot::Open(db)) => Ok(db.clone()),
            _ => Err(Error::ClosedConnection {
                name: name.to_string(),
            }),
        }
    }

    /// Names of all open databases.
    pub fn open_names(&self) -> Vec<String> {
        self.databases
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Open(db) => Some(db.name().to_string()),
                Slot::Opening | Slot::Deleting => None,
            })
            .collect()
    }

    /// Close `name`. Closing a database that is not open succeeds.
    pub async fn close(&self, name: &str) -> Result<()> {
        let Ok(db) = self.get(name) else {
            return Ok(());
        };
        db.close().await?;
        self.forget(&db);
        Ok(())
    }

    pub async fn execute_sql(
        &self,
        name: &str,
        sql: &str,
        args: impl Into<Args>,
    ) -> Result<StatementResult> {
        self.get(name)?.execute_sql(sql, args).await
    }

    pub async fn transaction<T, F, Fut>(&self, name: &str, body: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get(name)?.transaction(body).await
    }

    /// Remove the file for `name`. The database must not be open.
    ///
    /// The name stays reserved while the file is removed on the blocking
    /// pool, so it cannot be opened halfway through.
    pub async fn delete_database(&self, name: &str) -> Result<()> {
        let path = self.config.database_path(name)?;
        {
            let mut databases = self.databases.lock();
            if databases.contains_key(&path) {
                return Err(Error::ActiveHandle {
                    name: name.to_string(),
                });
            }
            databases.insert(path.clone(), Slot::Deleting);
        }
        let _reservation = Reservation {
            databases: self.databases.clone(),
            path: Some(path.clone()),
        };

        let engine = self.engine.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || engine.delete_file(&target))
            .await
            .map_err(|e| Error::Engine {
                code: None,
                message: format!("delete task failed: {e}"),
            })??;

        info!(db = %name, path = ?path, "Deleted database");
        Ok(())
    }

    /// Close every open database.
    pub async fn shutdown(&self) -> Result<()> {
        let open: Vec<Database> = self
            .databases
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Open(db) => Some(db.clone()),
                Slot::Opening | Slot::Deleting => None,
            })
            .collect();

        let results = futures::future::join_all(open.iter().map(Database::close)).await;
        let mut first_error = None;
        for (db, result) in open.iter().zip(results) {
            match result {
                Ok(()) => self.forget(db),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn forget(&self, db: &Database) {
        release(&self.databases, db.path(), db.id());
    }
}
