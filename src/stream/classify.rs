//! Sink error classification

use crate::sink::{SinkError, SinkErrorKind};

/// What the flush loop does with a failed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The condition is expected to clear; retry the same batch.
    Retryable,
    /// The batch can never succeed; stop intake.
    Fatal,
}

/// Label a sink error.
///
/// Kinds we cannot place default to retryable: a possible duplicate is
/// preferred over silently losing data.
pub fn classify(err: &SinkError) -> Disposition {
    match err.kind() {
        SinkErrorKind::Unavailable
        | SinkErrorKind::DeadlineExceeded
        | SinkErrorKind::ResourceExhausted
        | SinkErrorKind::Aborted
        | SinkErrorKind::Internal => Disposition::Retryable,
        SinkErrorKind::InvalidArgument
        | SinkErrorKind::FailedPrecondition
        | SinkErrorKind::PermissionDenied
        | SinkErrorKind::NotFound
        | SinkErrorKind::Unauthenticated => Disposition::Fatal,
        SinkErrorKind::Unknown => Disposition::Retryable,
    }
}
