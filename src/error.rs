use thiserror::Error;

/// Crate-wide error type for lifecycle operations.
///
/// Only failures that must be surfaced synchronously to a caller are
/// represented here (see the propagation rule in the module docs of
/// [`crate::facade`]). Hot-path failures — a full ring buffer, a stale
/// code-object pointer — are never turned into an `Error`; they are
/// absorbed into [`crate::StatisticsCounters`] instead.
#[derive(Debug, Error)]
pub enum Error {
    /// `start` was called while the profiler was already running.
    #[error("profiler is already running")]
    AlreadyRunning,

    /// A lifecycle operation that requires an active profiler was called
    /// while it was stopped.
    #[error("profiler is not running")]
    NotRunning,

    /// A configuration value was out of the range this crate accepts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The current platform/runtime combination cannot guarantee safe
    /// sampling (e.g. a lock-disabled runtime build with no safe
    /// platform backend).
    #[error("unsupported on this platform/runtime build: {reason}")]
    Unsupported { reason: String },

    /// A platform call failed (timer creation, signal install, thread
    /// suspend, ...) during a lifecycle operation.
    #[error("operating system call failed: {0}")]
    OperatingSystem(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
