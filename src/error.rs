//! Error types for merge operations.
//!
//! Failures that happen on independent sources or tables are gathered in an
//! [`ErrorCollector`] and surfaced together as an [`AggregateError`], so one
//! bad input never hides another.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::storage::pragma::Pragma;

/// Main error type for merge operations.
#[derive(Debug, Error)]
pub enum MergeError {
    /// File is missing, unreadable, or not a regular file.
    #[error("cannot access {}: {reason}", path.display())]
    Access { path: PathBuf, reason: String },

    /// A required table is absent from a database.
    #[error("missing table {table} in kismet database {}", path.display())]
    Schema { path: PathBuf, table: String },

    /// Opening or pinging a connection failed.
    #[error("failed to connect to {}: {source}", path.display())]
    Connection {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Pragma backup/restore failure.
    #[error(transparent)]
    Pragma(#[from] PragmaError),

    /// Lock contention outlasted the retry budget.
    #[error("{context}: database still busy after {attempts} attempts ({elapsed:?})")]
    EngineBusy {
        context: String,
        attempts: u32,
        elapsed: Duration,
    },

    /// Non-retryable engine failure.
    #[error("{context}: {source} (code {code})")]
    Engine {
        context: String,
        code: i32,
        #[source]
        source: rusqlite::Error,
    },

    /// The engine dropped a source transaction before it was committed.
    #[error("transaction for {alias} is no longer open")]
    TransactionLost { alias: String },

    /// Attach pool could not be built or handed out a connection.
    #[error("attach pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Lookup input is not a MAC address.
    #[error("invalid mac address: {0:?}")]
    InvalidMac(String),

    /// A worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Task(String),

    /// The run was cancelled before it completed.
    #[error("merge cancelled")]
    Cancelled,

    /// Several independent failures.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl MergeError {
    /// Wrap an engine error with a description of the failed step.
    pub fn engine(context: impl Into<String>, source: rusqlite::Error) -> Self {
        let code = source.sqlite_error().map_or(-1, |e| e.extended_code);
        MergeError::Engine {
            context: context.into(),
            code,
            source,
        }
    }

    /// Create an Access error.
    pub fn access(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MergeError::Access {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the engine reported lock contention (busy or locked).
    pub fn is_busy(&self) -> bool {
        match self {
            MergeError::Engine { source, .. } => matches!(
                source.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

/// Pragma state machine violations and apply failures.
#[derive(Debug, Error)]
pub enum PragmaError {
    #[error("no backup recorded for pragma {0}")]
    NoBackup(Pragma),

    #[error("stored pragma conflict: {pragma} backup is {value}")]
    Conflict { pragma: Pragma, value: String },

    #[error("{pragma} override already active (backup {stored})")]
    AlreadyOverridden { pragma: Pragma, stored: String },

    #[error("failed to read pragma {pragma}: {source}")]
    Read {
        pragma: Pragma,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to apply pragma {pragma} = {value}: {source}")]
    Apply {
        pragma: Pragma,
        value: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("engine kept {pragma} = {actual} instead of {requested}")]
    Rejected {
        pragma: Pragma,
        requested: String,
        actual: String,
    },
}

/// A join of independently observed failures.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<MergeError>,
}

impl AggregateError {
    pub fn new(errors: Vec<MergeError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[MergeError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<MergeError> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> std::result::Result<(), AggregateError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Thread-safe sink for failures observed by concurrent workers.
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector {
    errors: Arc<Mutex<Vec<MergeError>>>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. Nested aggregates are flattened.
    pub fn push(&self, err: MergeError) {
        match err {
            MergeError::Aggregate(inner) => {
                for err in inner.into_errors() {
                    self.push(err);
                }
            }
            err => {
                tracing::warn!(error = %err, "recorded merge failure");
                self.errors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(err);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything collected so far.
    pub fn drain(&self) -> AggregateError {
        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        AggregateError::new(std::mem::take(&mut *errors))
    }
}

/// Result type alias for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
