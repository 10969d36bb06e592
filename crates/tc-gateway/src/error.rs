//! Error types for the gateway's components.

use thiserror::Error;

/// Failures reported by an [`AgentController`](crate::controller::AgentController).
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("agent is already running")]
    AlreadyRunning,

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no terminal attached")]
    NoTerminal,

    #[error("terminal i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to signal process group: {0}")]
    Signal(#[from] nix::Error),
}

/// Failures reported by the [`ApprovalGate`](crate::approval::ApprovalGate).
///
/// A request that runs out of time is not an error; it resolves as
/// [`Decision::Expired`](tc_types::approval::Decision::Expired).
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(String),

    #[error("approval request {0} already has a waiter")]
    AlreadyAwaited(String),

    #[error("wait for approval request {0} was cancelled")]
    Cancelled(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown, malformed or owned by someone else.
    #[error("session not found")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Errors surfaced by the [`Gateway`](crate::Gateway) to a chat surface.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("user {0} is not allowed")]
    Unauthorized(i64),

    #[error("no active session; start one with /new or /continue")]
    NoActiveSession,

    #[error("no previous session to continue")]
    NoSessions,

    #[error("a turn is already running for this session")]
    Busy,

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
