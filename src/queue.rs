//! Per-connection request queue.
//!
//! Each open database gets one dispatcher thread that owns the engine handle.
//! Callers push [`Command`]s onto an unbounded channel and wait on a oneshot
//! reply. A transaction is a single queue entry: once its `Begin` is
//! dispatched the thread serves only that transaction's private channel
//! until it commits or rolls back.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineHandle, HandleOptions};
use crate::error::{Error, Result};
use crate::value::{StatementResult, Value};

const QUEUED: u8 = 0;
const DISPATCHED: u8 = 1;
const CANCELLED: u8 = 2;

/// Dispatch state of one queued request, shared by caller and dispatcher.
#[derive(Debug)]
pub(crate) struct Ticket(AtomicU8);

impl Ticket {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(QUEUED)))
    }

    /// Claim the request for execution. Fails if it was cancelled first.
    fn try_dispatch(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, DISPATCHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Withdraw the request. Fails once the dispatcher has claimed it.
    fn try_cancel(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELLED
    }
}

/// Flags the dispatcher publishes to callers.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) closed: AtomicBool,
    pub(crate) in_transaction: AtomicBool,
}

pub(crate) enum Command {
    Execute {
        sql: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<StatementResult>>,
        ticket: Arc<Ticket>,
    },
    Begin {
        span: mpsc::UnboundedReceiver<SpanCommand>,
        reply: oneshot::Sender<Result<()>>,
        ticket: Arc<Ticket>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Requests served while a transaction holds the queue.
pub(crate) enum SpanCommand {
    Execute {
        sql: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<StatementResult>>,
    },
    Commit {
        reply: oneshot::Sender<Result<()>>,
    },
    Rollback {
        reply: Option<oneshot::Sender<Result<()>>>,
    },
}

/// A submitted request awaiting its result.
///
/// Dropping it before it is dispatched withdraws it from the queue.
#[must_use = "a pending request does nothing unless waited on"]
pub struct PendingRequest<T = StatementResult> {
    name: String,
    receiver: oneshot::Receiver<Result<T>>,
    ticket: Arc<Ticket>,
    timeout: Option<Duration>,
}

impl<T> PendingRequest<T> {
    pub(crate) fn new(
        name: impl Into<String>,
        receiver: oneshot::Receiver<Result<T>>,
        ticket: Arc<Ticket>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.into(),
            receiver,
            ticket,
            timeout,
        }
    }

    /// Limit how long the request may wait before dispatch.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Remove the request from the queue. Returns `false` if the dispatcher
    /// already started it; it will then run to completion.
    pub fn cancel(&self) -> bool {
        self.ticket.try_cancel()
    }

    /// Wait for the result.
    pub async fn wait(mut self) -> Result<T> {
        if self.ticket.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.receiver).await {
                Ok(received) => received,
                Err(_) if self.ticket.try_cancel() => return Err(Error::Timeout),
                // Already running on the engine: no unilateral timeout.
                Err(_) => (&mut self.receiver).await,
            },
            None => (&mut self.receiver).await,
        };

        match received {
            Ok(result) => result,
            Err(_) if self.ticket.is_cancelled() => Err(Error::Cancelled),
            Err(_) => Err(Error::ClosedConnection {
                name: self.name.clone(),
            }),
        }
    }
}

impl<T> Drop for PendingRequest<T> {
    fn drop(&mut self) {
        self.ticket.try_cancel();
    }
}

/// Runs on the dispatcher thread once the handle has been closed.
pub(crate) type OnClosed = Box<dyn FnOnce() + Send>;

/// Start the dispatcher thread for `name` and wait until the handle is open.
pub(crate) async fn spawn_dispatcher(
    name: String,
    path: PathBuf,
    engine: Arc<dyn Engine>,
    options: HandleOptions,
    shared: Arc<Shared>,
    on_closed: Option<OnClosed>,
) -> Result<mpsc::UnboundedSender<Command>> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    let thread_name = format!("sqlite-{name}");
    std::thread::Builder::new()
        .name(thread_name)
        .spawn({
            let path = path.clone();
            move || {
                let handle = match engine.open_handle(&path, options) {
                    Ok(handle) => handle,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                Dispatcher {
                    name,
                    handle,
                    shared,
                    on_closed,
                }
                .run(receiver);
            }
        })
        .map_err(|e| Error::io(&path, e))?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(sender),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Engine {
            code: None,
            message: "dispatcher exited during open".to_string(),
        }),
    }
}

struct Dispatcher {
    name: String,
    handle: Box<dyn EngineHandle>,
    shared: Arc<Shared>,
    on_closed: Option<OnClosed>,
}

impl Dispatcher {
    fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        let mut close_reply = None;

        while let Some(command) = receiver.blocking_recv() {
            match command {
                Command::Execute {
                    sql,
                    args,
                    reply,
                    ticket,
                } => {
                    if !ticket.try_dispatch() {
                        continue;
                    }
                    debug!(db = %self.name, sql = %sql, "Dispatching statement");
                    let _ = reply.send(self.handle.exec(&sql, &args));
                }
                Command::Begin {
                    span,
                    reply,
                    ticket,
                } => {
                    if !ticket.try_dispatch() {
                        continue;
                    }
                    self.run_span(span, reply);
                }
                Command::Close { reply } => {
                    close_reply = Some(reply);
                    break;
                }
            }
        }

        // Anything still queued behind the close never reaches the engine.
        self.shared.closed.store(true, Ordering::Release);
        receiver.close();
        while let Ok(command) = receiver.try_recv() {
            self.reject(command);
        }

        let name = self.name;
        let result = self.handle.close();
        match &result {
            Ok(()) => info!(db = %name, "Closed SQLite handle"),
            Err(e) => warn!(db = %name, error = %e, "Failed to close SQLite handle"),
        }
        // The handle is gone even if closing reported an error.
        if let Some(on_closed) = self.on_closed {
            on_closed();
        }
        if let Some(reply) = close_reply {
            let _ = reply.send(result);
        }
    }

    fn reject(&self, command: Command) {
        let closed = || Error::ClosedConnection {
            name: self.name.clone(),
        };
        match command {
            Command::Execute { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            Command::Begin { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            Command::Close { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Hold the queue for one transaction, from BEGIN to its terminal state.
    fn run_span(
        &mut self,
        mut span: mpsc::UnboundedReceiver<SpanCommand>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        if let Err(e) = self.handle.exec("BEGIN", &[]) {
            let _ = ready.send(Err(e));
            return;
        }
        self.shared.in_transaction.store(true, Ordering::Release);
        debug!(db = %self.name, "Transaction began");

        if ready.send(Ok(())).is_err() {
            warn!(db = %self.name, "Caller left before transaction began; rolling back");
            self.abandon();
            return;
        }

        let (reply, result) = loop {
            match span.blocking_recv() {
                Some(SpanCommand::Execute { sql, args, reply }) => {
                    debug!(db = %self.name, sql = %sql, "Dispatching transaction statement");
                    let _ = reply.send(self.handle.exec(&sql, &args));
                }
                Some(SpanCommand::Commit { reply }) => break (Some(reply), self.commit()),
                Some(SpanCommand::Rollback { reply: Some(reply) }) => {
                    break (Some(reply), self.rollback())
                }
                Some(SpanCommand::Rollback { reply: None }) | None => {
                    warn!(db = %self.name, "Transaction abandoned; rolling back");
                    self.abandon();
                    break (None, Ok(()));
                }
            }
        };
        // Idle again before the caller hears the outcome.
        self.shared.in_transaction.store(false, Ordering::Release);
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn commit(&mut self) -> Result<()> {
        let err = match self.handle.exec("COMMIT", &[]) {
            Ok(_) => {
                debug!(db = %self.name, "Transaction committed");
                return Ok(());
            }
            Err(err) => err,
        };
        // A failed COMMIT can leave the transaction open, e.g. on a deferred
        // foreign key check.
        match self.rollback() {
            Ok(()) => Err(err),
            Err(rollback) => {
                warn!(db = %self.name, error = %rollback, "Rollback after failed commit failed");
                Err(err.with_rollback_failure(rollback))
            }
        }
    }

    fn rollback(&mut self) -> Result<()> {
        // Some engine errors already roll the transaction back.
        if self.handle.is_autocommit() {
            return Ok(());
        }
        self.handle.exec("ROLLBACK", &[])?;
        debug!(db = %self.name, "Transaction rolled back");
        Ok(())
    }

    fn abandon(&mut self) {
        if let Err(e) = self.rollback() {
            warn!(db = %self.name, error = %e, "Rollback of abandoned transaction failed");
        }
        self.shared.in_transaction.store(false, Ordering::Release);
    }
}
