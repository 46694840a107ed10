//! Core error types

use thiserror::Error;

/// Errors surfaced by an input channel transport.
///
/// `BufferFull` and `Consumed` are flow-control signals, not failures: the
/// dispatcher records a resume point and retries in a later dispatch cycle.
/// Everything else marks the channel as unrecoverably broken.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The staging buffer has no room for another motion sample.
    #[error("staging buffer is full")]
    BufferFull,

    /// The consumer has already consumed the staged event.
    #[error("staged event was already consumed")]
    Consumed,

    /// The transport is in a state that does not permit the operation.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

/// Errors returned by the dispatcher's channel management API.
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("input channel '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("input channel '{0}' is not registered")]
    NotRegistered(String),

    #[error("failed to initialize input channel '{name}': {source}")]
    ChannelInit {
        name: String,
        #[source]
        source: ChannelError,
    },
}

/// Result type for dispatcher operations.  The error defaults to
/// [`RegisterError`]; transport paths name [`ChannelError`] explicitly.
pub type Result<T, E = RegisterError> = std::result::Result<T, E>;
