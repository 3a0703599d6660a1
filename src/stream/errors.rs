//! Errors observed over a writer's lifetime

use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

use crate::sink::SinkError;

#[derive(Debug, Error)]
pub enum WriterError {
    /// Append failed and the batch was requeued.
    #[error("append of {records} records failed, will retry: {source}")]
    Retryable {
        records: usize,
        #[source]
        source: SinkError,
    },

    /// Append failed permanently; intake was halted.
    #[error("append of {records} records failed permanently: {source}")]
    Fatal {
        records: usize,
        #[source]
        source: SinkError,
    },

    #[error("dropped {records} records after {attempts} failed append attempts: {source}")]
    RetriesExhausted {
        records: usize,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("discarded {records} records left after a fatal sink error")]
    Discarded { records: usize },

    #[error("flush loop terminated abnormally: {0}")]
    Loop(String),

    #[error("failed to close sink: {0}")]
    Close(#[source] SinkError),
}

/// Append-only error accumulator shared by the flush loop (writer) and
/// shutdown (reader).
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: Mutex<Vec<WriterError>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, err: WriterError) {
        self.lock().push(err);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Move every recorded error out of the log, oldest first.
    pub fn take(&self) -> Vec<WriterError> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WriterError>> {
        // A panic while holding the lock cannot leave a Vec half-pushed
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Every error a writer saw, returned once by shutdown.
#[derive(Debug)]
pub struct ShutdownError {
    errors: Vec<WriterError>,
}

impl ShutdownError {
    /// `None` when there is nothing to report.
    pub fn from_errors(errors: Vec<WriterError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self { errors })
        }
    }

    pub fn errors(&self) -> &[WriterError] {
        &self.errors
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}
