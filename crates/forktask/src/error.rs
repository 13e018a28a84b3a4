//! Error taxonomy and fatal-abort helpers.
//!
//! Per the runtime's design there is no user-level error channel: a task that
//! fails communicates through its own result convention. The variants here
//! only cover configuration mistakes and protocol violations detected by the
//! runtime itself (see `spec.md` §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid worker count {0}: must be >= 1")]
    InvalidWorkerCount(i64),

    #[error("steal discipline and split policy combination is not supported: {0}")]
    IncompatibleDisciplines(&'static str),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("failed to allocate {0}")]
    AllocationFailed(&'static str),
}

/// Abort the process with a diagnostic naming the worker and the violated
/// invariant. Used for protocol violations that have no recovery path
/// (steal of the sentinel, double free of a channel, `try > MAX_ATTEMPTS`).
#[cold]
#[inline(never)]
pub fn fatal(worker_id: i64, context: &str) -> ! {
    tracing::error!(worker_id, context, "fatal runtime invariant violated, aborting");
    std::process::abort()
}
