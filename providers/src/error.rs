//! Provider error types.
//!
//! The three kinds that matter to callers map onto the dispatch policy:
//! transport errors are retried once after a session rebuild, tool
//! errors are relayed verbatim, protocol errors end the session.

use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider not registered: {0}")]
    NotRegistered(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tool execution failed: {0}")]
    Tool(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("unresolved environment variables: {}", vars.join(", "))]
    UnresolvedEnv { vars: Vec<String> },

    #[error("invalid provider spec: {0}")]
    Spec(String),
}

impl ProviderError {
    /// True for failures worth one retry against a fresh session.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(_) | ProviderError::ConnectionFailed(_)
        )
    }
}
