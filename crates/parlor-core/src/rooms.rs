use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RoomStoreError;
use crate::ids::{RoomId, UserId};

/// Most recent messages returned per room.
pub const MAX_ROOM_MESSAGES: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Room persistence as seen by the hub. The hub only relies on it for
/// cache-miss room lookups and for recording chat history.
pub trait RoomStore: Send + Sync {
    fn list_rooms(&self) -> Result<Vec<Room>, RoomStoreError>;

    /// Most-recent-first, capped at [`MAX_ROOM_MESSAGES`].
    fn list_messages(&self, room_id: RoomId) -> Result<Vec<Message>, RoomStoreError>;

    fn create_room(&self) -> Result<RoomId, RoomStoreError>;

    fn create_message(
        &self,
        user_id: UserId,
        room_id: RoomId,
        content: &str,
    ) -> Result<(), RoomStoreError>;
}
