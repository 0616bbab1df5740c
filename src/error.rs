//! Error kinds surfaced by the engine.
//!
//! Plan-construction and materialization errors are returned synchronously.
//! Step-execution errors are recorded on the request and surfaced through
//! [`RequestHandle::check_status`](crate::group::RequestHandle::check_status),
//! which keeps returning [`Error::InProgress`] until a terminal status has
//! been set exactly once.

use crate::host::MemberIndex;

/// Engine result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure mode the engine reports to its caller.
///
/// Transport failures carry a `retryable` flag: retryable send failures are
/// replayed by the step executor from the current iterator offset, while
/// non-retryable ones terminate the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Bad argument: algorithm mismatch, unsupported member count, a plan
    /// exceeding the wire step-index range, and similar caller mistakes.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// An allocation request could not be satisfied.
    #[error("out of memory while allocating {0}")]
    NoMemory(&'static str),

    /// A message or lookup addressed an unknown group.
    #[error("no such element: {0}")]
    NoElement(String),

    /// Non-terminal status of an asynchronous operation.
    #[error("operation in progress")]
    InProgress,

    /// The request was cancelled by the caller.
    #[error("operation canceled")]
    Canceled,

    /// Failure reported by the underlying transport, propagated verbatim.
    #[error("transport error: {reason} (retryable: {retryable})")]
    Transport { reason: String, retryable: bool },

    /// Address resolution for a peer failed.
    #[error("member {0} is unreachable")]
    Unreachable(MemberIndex),
}

impl Error {
    /// True for transport errors the executor may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { retryable: true, .. })
    }
}
