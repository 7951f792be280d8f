//! Connection handle for one named database.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::engine::{Engine, HandleOptions};
use crate::error::{Error, Result};
use crate::queue::{spawn_dispatcher, Command, OnClosed, PendingRequest, Shared, Ticket};
use crate::sql::{placeholder_count, statement_kind};
use crate::transaction::{self, holds_span, Transaction};
use crate::value::{Args, StatementResult};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Anything statements can be executed against: a [`Database`] or a
/// [`Transaction`].
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, sql: &str, args: Args) -> Result<StatementResult>;
}

/// Checks that need no engine: transaction control and argument count.
pub(crate) fn check_statement(sql: &str, args: &Args) -> Result<()> {
    if statement_kind(sql).is_transaction_control() {
        return Err(Error::TransactionControl {
            statement: sql.trim().to_string(),
        });
    }
    let expected = placeholder_count(sql);
    if expected != args.len() {
        return Err(Error::ArgumentCount {
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

struct Inner {
    id: u64,
    name: String,
    path: PathBuf,
    sender: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    request_timeout: Option<Duration>,
}

/// Handle to an open database. Clones share the same connection and queue.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Database {
    /// `on_closed` receives this handle's id once the engine handle is closed.
    pub(crate) async fn open(
        name: &str,
        path: PathBuf,
        engine: Arc<dyn Engine>,
        options: HandleOptions,
        request_timeout: Option<Duration>,
        on_closed: Option<Box<dyn FnOnce(u64) + Send>>,
    ) -> Result<Self> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared::default());
        let on_closed = on_closed.map(|f| -> OnClosed { Box::new(move || f(id)) });
        let sender = spawn_dispatcher(
            name.to_string(),
            path.clone(),
            engine,
            options,
            shared.clone(),
            on_closed,
        )
        .await?;

        info!(db = %name, path = ?path, "Opened database");
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                name: name.to_string(),
                path,
                sender,
                shared,
                request_timeout,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_open(&self) -> bool {
        !self.inner.shared.closed.load(Ordering::Acquire)
    }

    /// Whether a transaction currently holds this connection.
    pub fn in_transaction(&self) -> bool {
        self.inner.shared.in_transaction.load(Ordering::Acquire)
    }

    pub(crate) fn request_timeout(&self) -> Option<Duration> {
        self.inner.request_timeout
    }

    fn closed_error(&self) -> Error {
        Error::ClosedConnection {
            name: self.inner.name.clone(),
        }
    }

    pub(crate) fn enqueue(&self, command: Command) -> Result<()> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        self.inner
            .sender
            .send(command)
            .map_err(|_| self.closed_error())
    }

    /// Queue a statement and return without waiting.
    ///
    /// Submission order is execution order. The returned request can be
    /// cancelled or given a timeout while it is still queued.
    pub fn submit(&self, sql: &str, args: impl Into<Args>) -> Result<PendingRequest> {
        let args = args.into();
        if holds_span(self.id()) {
            // Inside our own transaction body this would wait on ourselves.
            return Err(Error::TransactionInProgress {
                name: self.inner.name.clone(),
            });
        }
        if !self.is_open() {
            return Err(self.closed_error());
        }
        check_statement(sql, &args)?;

        let (reply, receiver) = oneshot::channel();
        let ticket = Ticket::new();
        self.enqueue(Command::Execute {
            sql: sql.to_string(),
            args: args.values,
            reply,
            ticket: ticket.clone(),
        })?;
        Ok(PendingRequest::new(
            self.name(),
            receiver,
            ticket,
            self.inner.request_timeout,
        ))
    }

    /// Execute one statement outside any transaction.
    pub async fn execute_sql(
        &self,
        sql: &str,
        args: impl Into<Args>,
    ) -> Result<StatementResult> {
        self.submit(sql, args)?.wait().await
    }

    /// Run `body` inside a transaction. Commits if it returns `Ok`, rolls
    /// back and returns its error otherwise.
    pub async fn transaction<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        transaction::run(self, body).await
    }

    /// Close the connection once everything queued ahead of it has run.
    ///
    /// Refuses while a transaction is in progress rather than discarding it.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if holds_span(self.id()) || self.in_transaction() {
            return Err(Error::ActiveTransaction {
                name: self.inner.name.clone(),
            });
        }
        if self.inner.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (reply, receiver) = oneshot::channel();
        if self.inner.sender.send(Command::Close { reply }).is_err() {
            return Ok(());
        }
        receiver.await.unwrap_or(Ok(()))
    }
}

#[async_trait]
impl Executor for Database {
    async fn execute(&self, sql: &str, args: Args) -> Result<StatementResult> {
        self.execute_sql(sql, args).await
    }
}
