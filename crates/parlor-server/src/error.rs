use parlor_core::errors::DecodeError;
use parlor_core::ids::RoomId;

/// Failure while routing one inbound event.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invalid room: {0}")]
    InvalidRoom(RoomId),

    #[error("session has not joined a room")]
    NoRoom,

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl HubError {
    /// Protocol violations end the session. Anything else only drops the frame.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidAction(_) | Self::InvalidRoom(_) | Self::NoRoom => true,
            Self::Decode(_) => false,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidAction(_) => "invalid_action",
            Self::InvalidRoom(_) | Self::NoRoom => "invalid_room",
            Self::Decode(_) => "decode",
        }
    }
}
