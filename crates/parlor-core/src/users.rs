use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::UserStoreError;
use crate::ids::UserId;

/// A registered account. Only the bcrypt hash of the password is kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Account persistence used by the REST layer for sign-up and login.
pub trait UserStore: Send + Sync {
    /// Fails with [`UserStoreError::Conflict`] when the username is taken.
    fn create_user(&self, username: &str, password_hash: &str) -> Result<UserId, UserStoreError>;

    /// Fails with [`UserStoreError::NotFound`] for an unknown username.
    fn find_by_username(&self, username: &str) -> Result<User, UserStoreError>;

    fn list_users(&self) -> Result<Vec<User>, UserStoreError>;
}
