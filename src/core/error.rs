//! Error kinds surfaced by the engine and the conversation loop.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    /// The host has no GPU compute support or no usable adapter. Not retryable.
    #[error("GPU compute is not available: {0}")]
    CapabilityMissing(String),

    /// The engine could not be constructed for the requested model.
    #[error("{0}")]
    InitFailure(String),

    /// Generation failed after a request was accepted.
    #[error("{0}")]
    StreamFailure(String),

    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
