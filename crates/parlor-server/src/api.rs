//! REST routes for rooms, room history and accounts.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use parlor_core::errors::{RoomStoreError, UserStoreError};
use parlor_core::ids::{RoomId, UserId};
use parlor_core::users::User;
use parlor_core::AuthenticatedUser;

use crate::auth::AuthError;
use crate::server::AppState;

/// Error returned by the REST handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Conflict(_) => "CONFLICT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            Self::Internal(msg) => error!(error_code = code, message = %msg, "api error"),
            _ => tracing::debug!(error_code = code, message = %message, "client error"),
        }

        (status, Json(ErrorResponse { error: message, code })).into_response()
    }
}

impl From<RoomStoreError> for ApiError {
    fn from(err: RoomStoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<UserStoreError> for ApiError {
    fn from(err: UserStoreError) -> Self {
        match err {
            UserStoreError::Conflict(name) => Self::Conflict(format!("username {name} is taken")),
            UserStoreError::NotFound(name) => Self::NotFound(name),
            UserStoreError::Backend(msg) => Self::Internal(msg),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::Internal(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Run synchronous store work off the async worker threads.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
}

/// bcrypt work factor. Debug builds use the minimum to keep tests fast.
fn hash_cost() -> u32 {
    if cfg!(debug_assertions) {
        4
    } else {
        bcrypt::DEFAULT_COST
    }
}

#[derive(Debug, Serialize)]
pub struct RoomView {
    pub id: RoomId,
    pub created_at: DateTime<Utc>,
    /// Sessions currently joined to the room on this hub.
    pub occupants: usize,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: i64,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct Created<T> {
    pub id: T,
}

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
}

pub(crate) async fn list_rooms(State(state): State<AppState>) -> ApiResult<Json<Vec<RoomView>>> {
    let store = state.hub.store();
    let rooms = blocking(move || Ok(store.list_rooms()?)).await?;
    let views = rooms
        .into_iter()
        .map(|room| RoomView {
            id: room.id,
            created_at: room.created_at,
            occupants: state.hub.room_occupancy(room.id),
        })
        .collect();
    Ok(Json(views))
}

pub(crate) async fn create_room(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<(StatusCode, Json<Created<RoomId>>)> {
    let store = state.hub.store();
    let id = blocking(move || Ok(store.create_room()?)).await?;
    info!(room_id = %id, user = %user.username, "room created");
    Ok((StatusCode::CREATED, Json(Created { id })))
}

pub(crate) async fn list_messages(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
) -> ApiResult<Json<Vec<MessageView>>> {
    let room = RoomId(room_id);
    let hub = state.hub.clone();
    let messages = blocking(move || {
        if !hub.is_valid_room(room) {
            return Err(ApiError::NotFound(format!("room {room}")));
        }
        Ok(hub.store().list_messages(room)?)
    })
    .await?;

    Ok(Json(
        messages
            .into_iter()
            .map(|m| MessageView {
                id: m.id,
                user_id: m.user_id,
                content: m.content,
                created_at: m.created_at,
            })
            .collect(),
    ))
}

pub(crate) async fn register(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> ApiResult<(StatusCode, Json<Created<UserId>>)> {
    let username = body.username.trim().to_string();
    if username.is_empty() || body.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username and password are required".to_string(),
        ));
    }

    let users = state.users.clone();
    let name = username.clone();
    let id = blocking(move || {
        let hash = bcrypt::hash(&body.password, hash_cost())
            .map_err(|e| ApiError::Internal(format!("failed to hash password: {e}")))?;
        Ok(users.create_user(&name, &hash)?)
    })
    .await?;

    info!(user_id = %id, username = %username, "user registered");
    Ok((StatusCode::CREATED, Json(Created { id })))
}

pub(crate) async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<User>>> {
    let users = state.users.clone();
    let list = blocking(move || Ok(users.list_users()?)).await?;
    Ok(Json(list))
}

pub(crate) async fn login(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> ApiResult<Json<LoginResponse>> {
    let users = state.users.clone();
    let username = body.username.clone();
    let user = blocking(move || {
        let user = match users.find_by_username(&body.username) {
            Ok(user) => user,
            Err(UserStoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let matches = bcrypt::verify(&body.password, &user.password_hash)
            .map_err(|e| ApiError::Internal(format!("failed to verify password: {e}")))?;
        Ok(matches.then_some(user))
    })
    .await?;

    let Some(user) = user else {
        warn!(username = %username, "login rejected");
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    };

    let token = state
        .auth
        .issue(&AuthenticatedUser::new(user.id, user.username.clone()))?;
    info!(user_id = %user.id, "user logged in");
    Ok(Json(LoginResponse { token }))
}
