use chrono::{DateTime, SecondsFormat, Utc};
use tracing::instrument;

use parlor_core::errors::RoomStoreError;
use parlor_core::ids::{RoomId, UserId};
use parlor_core::rooms::{Message, Room, RoomStore, MAX_ROOM_MESSAGES};

use crate::database::Database;
use crate::error::StoreError;

/// Fixed-width timestamps so lexical order matches chronological order.
pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str, table: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column: "created_at",
            detail: e.to_string(),
        })
}

pub struct RoomRepo {
    db: Database,
}

impl RoomRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<Room>, StoreError> {
        let rows: Vec<(i64, String)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, created_at FROM rooms ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(id, created_at)| {
                Ok(Room {
                    id: RoomId(id),
                    created_at: parse_ts(&created_at, "rooms")?,
                })
            })
            .collect()
    }

    #[instrument(skip_all, fields(room_id = %room_id))]
    pub fn messages(&self, room_id: RoomId) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<(i64, i64, i64, String, String)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, room_id, content, created_at FROM messages
                 WHERE room_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![room_id.get(), MAX_ROOM_MESSAGES as i64],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(id, user_id, room_id, content, created_at)| {
                Ok(Message {
                    id,
                    user_id: UserId(user_id),
                    room_id: RoomId(room_id),
                    content,
                    created_at: parse_ts(&created_at, "messages")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    pub fn create(&self) -> Result<RoomId, StoreError> {
        let id = self.db.with_conn(|conn| {
            let now = now_text();
            conn.execute(
                "INSERT INTO rooms (created_at, updated_at) VALUES (?1, ?1)",
                [&now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::info!(room_id = id, "room created");
        Ok(RoomId(id))
    }

    #[instrument(skip_all, fields(user_id = %user_id, room_id = %room_id))]
    pub fn add_message(
        &self,
        user_id: UserId,
        room_id: RoomId,
        content: &str,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = now_text();
            conn.execute(
                "INSERT INTO messages (user_id, room_id, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![user_id.get(), room_id.get(), content, now],
            )?;
            Ok(())
        })
    }
}

impl RoomStore for RoomRepo {
    fn list_rooms(&self) -> Result<Vec<Room>, RoomStoreError> {
        Ok(self.list()?)
    }

    fn list_messages(&self, room_id: RoomId) -> Result<Vec<Message>, RoomStoreError> {
        Ok(self.messages(room_id)?)
    }

    fn create_room(&self) -> Result<RoomId, RoomStoreError> {
        Ok(self.create()?)
    }

    fn create_message(
        &self,
        user_id: UserId,
        room_id: RoomId,
        content: &str,
    ) -> Result<(), RoomStoreError> {
        Ok(self.add_message(user_id, room_id, content)?)
    }
}
