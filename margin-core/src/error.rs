use thiserror::Error;

use crate::types::{CommentStatus, DocumentPath};

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Failure reported by the persistence gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Connection failure, timeout or server-side 5xx. Retryable.
    #[error("transient network error: {0}")]
    Transient(String),
    /// The store refused the request. Never retried.
    #[error("persistence rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Failure starting or talking to the agent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    #[error("agent rejected request: {0}")]
    Rejected(String),
    #[error("agent protocol error: {0}")]
    Protocol(String),
}

/// Errors surfaced by the engine's UI-facing operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("edit batch is empty")]
    EmptyBatch,
    #[error("an invocation is already pending for {0}")]
    AlreadyPending(DocumentPath),
    #[error("no invocation is pending for {0}")]
    NothingPending(DocumentPath),
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("persistence rejected: {0}")]
    PersistenceRejected(String),
    #[error("agent error: {0}")]
    Agent(String),
    #[error("cancelled by user")]
    Cancelled,
    #[error("comment cannot move from {from} to {to}")]
    InvalidTransition { from: CommentStatus, to: CommentStatus },
    #[error("comment {0} has not been persisted yet")]
    UnpersistedComment(String),
    #[error("unknown comment {0}")]
    UnknownComment(String),
    #[error("unknown session {0}")]
    UnknownSession(String),
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transient(msg) => EngineError::TransientNetwork(msg),
            GatewayError::Rejected(msg) => EngineError::PersistenceRejected(msg),
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        EngineError::Agent(err.to_string())
    }
}
