/// Failure to decode or encode a wire frame.
///
/// `Envelope` is fatal to the single frame only; the connection stays up.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed event envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("could not decode {action} payload: {source}")]
    Payload {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not encode event payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Failures of the message queue behind the broker port.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker closed")]
    Closed,

    #[error("publish timed out")]
    Timeout,

    #[error("broker transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
        }
    }
}

/// Error surfaced by a room persistence backend.
#[derive(Clone, Debug, thiserror::Error)]
#[error("room store: {0}")]
pub struct RoomStoreError(pub String);

/// Error surfaced by an account persistence backend.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("username already taken: {0}")]
    Conflict(String),

    #[error("user not found: {0}")]
    NotFound(String),

    #[error("user store: {0}")]
    Backend(String),
}
