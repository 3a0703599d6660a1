//! Downstream sinks
//!
//! A sink accepts a batch of opaque records in one append call. The stream
//! writer never looks inside a record; it only needs to know whether an
//! append failed and, if so, what kind of failure it was.

mod schema;
pub mod sqlite;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::stream::Record;

pub use sqlite::SqliteSink;

/// Failure categories a sink can report.
///
/// Mirrors the usual RPC status taxonomy so that sinks backed by very
/// different stores can be classified by one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkErrorKind {
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    Aborted,
    Internal,
    InvalidArgument,
    FailedPrecondition,
    PermissionDenied,
    NotFound,
    Unauthenticated,
    /// The sink could not tell what went wrong.
    Unknown,
}

impl SinkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkErrorKind::Unavailable => "unavailable",
            SinkErrorKind::DeadlineExceeded => "deadline exceeded",
            SinkErrorKind::ResourceExhausted => "resource exhausted",
            SinkErrorKind::Aborted => "aborted",
            SinkErrorKind::Internal => "internal",
            SinkErrorKind::InvalidArgument => "invalid argument",
            SinkErrorKind::FailedPrecondition => "failed precondition",
            SinkErrorKind::PermissionDenied => "permission denied",
            SinkErrorKind::NotFound => "not found",
            SinkErrorKind::Unauthenticated => "unauthenticated",
            SinkErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SinkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a sink append or close
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct SinkError {
    kind: SinkErrorKind,
    message: String,
}

impl SinkError {
    pub fn new(kind: SinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> SinkErrorKind {
        self.kind
    }
}

/// A destination that commits records in batches.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Commit every record of `batch`, in order.
    async fn append(&self, batch: &[Record]) -> Result<(), SinkError>;

    /// Release connections and client resources.
    ///
    /// Must be safe to call after a failed or partial stop.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
