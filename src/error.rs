//! Error taxonomy for connection, statement and transaction operations.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which kind of constraint the engine reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    PrimaryKey,
    NotNull,
    ForeignKey,
    Check,
    Other,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintKind::Unique => "unique",
            ConstraintKind::PrimaryKey => "primary key",
            ConstraintKind::NotNull => "not null",
            ConstraintKind::ForeignKey => "foreign key",
            ConstraintKind::Check => "check",
            ConstraintKind::Other => "constraint",
        };
        f.write_str(name)
    }
}

/// Flat classification of [`Error`], stable for matching by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyOpen,
    ClosedConnection,
    Io,
    ArgumentCount,
    ConstraintViolation,
    TransactionInProgress,
    Cancelled,
    Timeout,
    ActiveTransaction,
    ActiveHandle,
    Engine,
    TransactionControl,
    TransactionFinished,
    Aborted,
    Caller,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("database {name} is already open")]
    AlreadyOpen { name: String },

    #[error("database {name} is closed")]
    ClosedConnection { name: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("statement expects {expected} argument(s) but {actual} were supplied")]
    ArgumentCount { expected: usize, actual: usize },

    #[error("{kind} constraint violated: {message}")]
    ConstraintViolation {
        kind: ConstraintKind,
        /// Engine-reported constraint target, e.g. `users.email`
        constraint: Option<String>,
        message: String,
    },

    #[error("a transaction is already in progress on {name}")]
    TransactionInProgress { name: String },

    #[error("request was cancelled before dispatch")]
    Cancelled,

    #[error("request timed out before dispatch")]
    Timeout,

    #[error("database {name} has an active transaction")]
    ActiveTransaction { name: String },

    #[error("database {name} still has an open handle")]
    ActiveHandle { name: String },

    #[error("engine error: {message}")]
    Engine { code: Option<i32>, message: String },

    #[error("transaction control statements must go through transaction(): {statement}")]
    TransactionControl { statement: String },

    #[error("transaction has already finished")]
    TransactionFinished,

    #[error("transaction aborted: {reason}")]
    Aborted { reason: String },

    #[error(transparent)]
    Caller(#[from] anyhow::Error),

    /// The original failure, with the failed rollback attached as context.
    #[error("{original} (rollback also failed: {rollback})")]
    RollbackFailed {
        #[source]
        original: Box<Error>,
        rollback: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Explicit abort from inside a transaction body.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Error::Aborted {
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Classification of this error. A failed rollback reports the kind of
    /// the error that triggered it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyOpen { .. } => ErrorKind::AlreadyOpen,
            Error::ClosedConnection { .. } => ErrorKind::ClosedConnection,
            Error::Io { .. } => ErrorKind::Io,
            Error::ArgumentCount { .. } => ErrorKind::ArgumentCount,
            Error::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            Error::TransactionInProgress { .. } => ErrorKind::TransactionInProgress,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Timeout => ErrorKind::Timeout,
            Error::ActiveTransaction { .. } => ErrorKind::ActiveTransaction,
            Error::ActiveHandle { .. } => ErrorKind::ActiveHandle,
            Error::Engine { .. } => ErrorKind::Engine,
            Error::TransactionControl { .. } => ErrorKind::TransactionControl,
            Error::TransactionFinished => ErrorKind::TransactionFinished,
            Error::Aborted { .. } => ErrorKind::Aborted,
            Error::Caller(_) => ErrorKind::Caller,
            Error::RollbackFailed { original, .. } => original.kind(),
        }
    }

    /// The rollback failure attached to this error, if any.
    pub fn rollback_failure(&self) -> Option<&Error> {
        match self {
            Error::RollbackFailed { rollback, .. } => Some(rollback.as_ref()),
            _ => None,
        }
    }

    /// Strip any attached rollback failure and return the triggering error.
    pub fn into_original(self) -> Error {
        match self {
            Error::RollbackFailed { original, .. } => original.into_original(),
            other => other,
        }
    }

    pub(crate) fn with_rollback_failure(self, rollback: Error) -> Self {
        Error::RollbackFailed {
            original: Box::new(self),
            rollback: Box::new(rollback),
        }
    }

    /// Convert an engine failure from rusqlite into the taxonomy.
    pub(crate) fn from_engine(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(failure, message) => {
                let message = message.unwrap_or_else(|| failure.to_string());
                if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                    let (kind, constraint) = classify_constraint(failure.extended_code, &message);
                    Error::ConstraintViolation {
                        kind,
                        constraint,
                        message,
                    }
                } else {
                    Error::Engine {
                        code: Some(failure.extended_code),
                        message,
                    }
                }
            }
            other => Error::Engine {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

/// Map an extended SQLite result code to a constraint kind and pull the
/// constraint target out of messages like `UNIQUE constraint failed: users.email`.
fn classify_constraint(extended_code: i32, message: &str) -> (ConstraintKind, Option<String>) {
    use rusqlite::ffi;

    let kind = match extended_code {
        ffi::SQLITE_CONSTRAINT_UNIQUE => ConstraintKind::Unique,
        ffi::SQLITE_CONSTRAINT_PRIMARYKEY => ConstraintKind::PrimaryKey,
        ffi::SQLITE_CONSTRAINT_NOTNULL => ConstraintKind::NotNull,
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => ConstraintKind::ForeignKey,
        ffi::SQLITE_CONSTRAINT_CHECK => ConstraintKind::Check,
        _ => ConstraintKind::Other,
    };
    let constraint = message
        .split_once("constraint failed:")
        .map(|(_, target)| target.trim().to_string())
        .filter(|target| !target.is_empty());
    (kind, constraint)
}
