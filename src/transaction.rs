//! Transaction controller.
//!
//! A transaction runs `idle -> active -> {committed, rolled-back} -> idle`.
//! The body gets a [`Transaction`]; its statements go down a private channel
//! that the dispatcher serves exclusively while the span is open.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::connection::{check_statement, Database, Executor};
use crate::error::{Error, Result};
use crate::queue::{Command, PendingRequest, SpanCommand, Ticket};
use crate::value::{Args, StatementResult};

tokio::task_local! {
    /// Ids of the connections whose transaction span the current task holds.
    static HELD_SPANS: Vec<u64>;
}

/// Whether the current task is inside a transaction body on connection `id`.
pub(crate) fn holds_span(id: u64) -> bool {
    HELD_SPANS
        .try_with(|held| held.contains(&id))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

struct Inner {
    name: String,
    sender: mpsc::UnboundedSender<SpanCommand>,
    state: Mutex<TransactionState>,
    statements: Mutex<Vec<String>>,
}

/// Handle to an active transaction, passed to the transaction body.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl Transaction {
    fn new(name: &str, sender: mpsc::UnboundedSender<SpanCommand>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                sender,
                state: Mutex::new(TransactionState::Active),
                statements: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn database_name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock()
    }

    /// Statements issued through this transaction, in order.
    pub fn statements(&self) -> Vec<String> {
        self.inner.statements.lock().clone()
    }

    /// Execute one statement inside the transaction.
    pub async fn execute_sql(
        &self,
        sql: &str,
        args: impl Into<Args>,
    ) -> Result<StatementResult> {
        let args = args.into();
        if self.state() != TransactionState::Active {
            return Err(Error::TransactionFinished);
        }
        if crate::sql::statement_kind(sql).opens_transaction() {
            return Err(Error::TransactionInProgress {
                name: self.inner.name.clone(),
            });
        }
        check_statement(sql, &args)?;

        let (reply, receiver) = oneshot::channel();
        self.inner
            .sender
            .send(SpanCommand::Execute {
                sql: sql.to_string(),
                args: args.values,
                reply,
            })
            .map_err(|_| Error::TransactionFinished)?;
        self.inner.statements.lock().push(sql.to_string());

        receiver.await.map_err(|_| Error::TransactionFinished)?
    }

    async fn finish(&self, command: impl FnOnce(oneshot::Sender<Result<()>>) -> SpanCommand) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.inner
            .sender
            .send(command(reply))
            .map_err(|_| Error::TransactionFinished)?;
        receiver.await.map_err(|_| Error::ClosedConnection {
            name: self.inner.name.clone(),
        })?
    }

    fn set_state(&self, state: TransactionState) {
        *self.inner.state.lock() = state;
    }
}

#[async_trait]
impl Executor for Transaction {
    async fn execute(&self, sql: &str, args: Args) -> Result<StatementResult> {
        self.execute_sql(sql, args).await
    }
}

/// Ends the span if the body panics or the caller drops the future.
struct SpanGuard {
    tx: Option<Transaction>,
}

impl SpanGuard {
    async fn commit(mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Err(Error::TransactionFinished);
        };
        let result = tx
            .finish(|reply| SpanCommand::Commit { reply })
            .await;
        tx.set_state(match result {
            Ok(()) => TransactionState::Committed,
            Err(_) => TransactionState::RolledBack,
        });
        result
    }

    async fn rollback(mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Err(Error::TransactionFinished);
        };
        let result = tx
            .finish(|reply| SpanCommand::Rollback { reply: Some(reply) })
            .await;
        tx.set_state(TransactionState::RolledBack);
        result
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.set_state(TransactionState::RolledBack);
            let _ = tx.inner.sender.send(SpanCommand::Rollback { reply: None });
        }
    }
}

/// Run `body` as one transaction on `db`.
///
/// The span waits its turn in the queue like any other request. A body error
/// rolls back and is returned unchanged; a failed rollback is attached to it.
pub(crate) async fn run<T, F, Fut>(db: &Database, body: F) -> Result<T>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if holds_span(db.id()) {
        return Err(Error::TransactionInProgress {
            name: db.name().to_string(),
        });
    }

    let (sender, span) = mpsc::unbounded_channel();
    let (reply, receiver) = oneshot::channel();
    let ticket = Ticket::new();
    db.enqueue(Command::Begin {
        span,
        reply,
        ticket: ticket.clone(),
    })?;
    PendingRequest::new(db.name(), receiver, ticket, db.request_timeout())
        .wait()
        .await?;

    let tx = Transaction::new(db.name(), sender);
    let guard = SpanGuard {
        tx: Some(tx.clone()),
    };

    let held = HELD_SPANS
        .try_with(|held| held.clone())
        .unwrap_or_default()
        .into_iter()
        .chain(std::iter::once(db.id()))
        .collect();
    let outcome = HELD_SPANS.scope(held, body(tx)).await;

    match outcome {
        Ok(value) => guard.commit().await.map(|()| value),
        Err(err) => match guard.rollback().await {
            Ok(()) => Err(err),
            Err(rollback) => {
                warn!(db = %db.name(), error = %rollback, "Rollback failed");
                Err(err.with_rollback_failure(rollback))
            }
        },
    }
}
