//! Batching stream writer
//!
//! Records pushed by request handlers land on a bounded intake channel. A
//! single background task drains the channel into a buffer and commits the
//! buffer to a [`Sink`](crate::sink::Sink) whenever it fills up or the flush
//! timer fires.

mod buffer;
mod classify;
mod errors;
mod writer;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

pub use buffer::Buffer;
pub use classify::{classify, Disposition};
pub use errors::{ErrorLog, ShutdownError, WriterError};
pub use writer::StreamWriter;

/// Serialized, sink-ready bytes for one message
pub type Record = Bytes;

/// Why a record could not be enqueued
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("stream is closed")]
    Closed,
}

/// Anything a request handler can push records into.
#[async_trait]
pub trait RecordStream: Send + Sync + 'static {
    /// Enqueue one record, waiting while the stream is backpressured.
    ///
    /// Callers bound the wait with their own timeout; dropping the future
    /// abandons the send without enqueueing anything.
    async fn append(&self, record: Record) -> Result<(), EnqueueError>;

    /// Whether the stream has stopped accepting records for good.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Writer lifecycle: running -> draining -> stopped, never skipping a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
