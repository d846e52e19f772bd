use rusqlite::OptionalExtension;
use tracing::instrument;

use parlor_core::errors::UserStoreError;
use parlor_core::ids::UserId;
use parlor_core::users::{User, UserStore};

use crate::database::Database;
use crate::error::StoreError;
use crate::rooms::{now_text, parse_ts};

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, password_hash))]
    pub fn create(&self, username: &str, password_hash: &str) -> Result<UserId, StoreError> {
        let id = self.db.with_conn(|conn| {
            let now = now_text();
            conn.execute(
                "INSERT INTO users (username, password_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![username, password_hash, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::info!(user_id = id, "user created");
        Ok(UserId(id))
    }

    #[instrument(skip(self))]
    pub fn find_by_username(&self, username: &str) -> Result<User, StoreError> {
        let row: Option<(i64, String, String, String)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, password_hash, created_at FROM users WHERE username = ?1",
                    [username],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?)
        })?;

        let (id, username, password_hash, created_at) =
            row.ok_or_else(|| StoreError::NotFound(format!("user {username}")))?;
        Ok(User {
            id: UserId(id),
            username,
            password_hash,
            created_at: parse_ts(&created_at, "users")?,
        })
    }

    pub fn list(&self) -> Result<Vec<User>, StoreError> {
        let rows: Vec<(i64, String, String, String)> = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, username, password_hash, created_at FROM users ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(id, username, password_hash, created_at)| {
                Ok(User {
                    id: UserId(id),
                    username,
                    password_hash,
                    created_at: parse_ts(&created_at, "users")?,
                })
            })
            .collect()
    }
}

impl UserStore for UserRepo {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<UserId, UserStoreError> {
        Ok(self.create(username, password_hash)?)
    }

    fn find_by_username(&self, username: &str) -> Result<User, UserStoreError> {
        Ok(UserRepo::find_by_username(self, username)?)
    }

    fn list_users(&self) -> Result<Vec<User>, UserStoreError> {
        Ok(self.list()?)
    }
}
