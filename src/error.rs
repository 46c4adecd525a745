// jobsentry: error types

use thiserror::Error;

/// Agent result type
pub type AgentResult<T> = Result<T, AgentError>;

/// Agent error types
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("configuration error at {path}: {message}")]
    ConfigInvalid { path: String, message: String },

    #[error("job {0} already registered")]
    JobDuplicate(i64),

    #[error("job {0} has no process ids")]
    JobEmptyPids(i64),

    #[error("unknown collector: {0}")]
    CollectorUnknown(String),

    #[error("collector {0} failed to initialize: {1}")]
    CollectorInitFailed(String, String),

    #[error("transient collection failure for pid {pid}: {message}")]
    CollectTransient { pid: i32, message: String },

    #[error("sink readiness check failed: {0}")]
    SinkReadinessFailed(String),

    #[error("sink write failed: {0}")]
    SinkWriteFailed(String),

    #[error("lease is held by another node")]
    LeaseBusy,

    #[error("lease file corrupt, treating as absent: {0}")]
    LeaseCorrupt(String),

    #[error("failed to exec child: {0}")]
    ChildExec(String),
}

/// Errors expected in normal operation that must not abort the agent: a
/// vanished pid, a briefly-unavailable sink, or lease contention during
/// election.
pub fn is_transient(err: &AgentError) -> bool {
    matches!(
        err,
        AgentError::CollectTransient { .. }
            | AgentError::SinkWriteFailed(_)
            | AgentError::LeaseBusy
            | AgentError::LeaseCorrupt(_)
    )
}

/// Errors that should terminate the process at startup.
pub fn is_fatal_at_startup(err: &AgentError) -> bool {
    matches!(
        err,
        AgentError::ConfigInvalid { .. }
            | AgentError::SinkReadinessFailed(_)
            | AgentError::ChildExec(_)
    )
}
