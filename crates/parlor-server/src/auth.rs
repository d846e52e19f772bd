//! Token authentication for the websocket upgrade.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use parlor_core::ids::UserId;
use parlor_core::AuthenticatedUser;

/// Lifetime of issued tokens unless overridden with [`JwtAuthenticator::with_ttl`].
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    #[error("internal auth error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    error: String,
    error_code: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "missing_token"),
            AuthError::InvalidAuthHeader => (StatusCode::UNAUTHORIZED, "invalid_auth_header"),
            AuthError::InvalidToken(_) => (StatusCode::FORBIDDEN, "invalid_token"),
            AuthError::TokenExpired => (StatusCode::FORBIDDEN, "token_expired"),
            AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(AuthErrorResponse {
            error: self.to_string(),
            error_code,
        });
        (status, body).into_response()
    }
}

/// JWT claims carried by a parlor token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub id: i64,
    pub username: String,
    pub exp: i64,
}

/// Issues and validates HS256 tokens.
#[derive(Clone)]
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: chrono::Duration,
}

impl JwtAuthenticator {
    pub fn new(secret: &SecretString) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            ttl: chrono::Duration::hours(DEFAULT_TOKEN_TTL_HOURS),
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn issue(&self, user: &AuthenticatedUser) -> Result<String, AuthError> {
        let claims = Claims {
            id: user.id.get(),
            username: user.username.clone(),
            exp: (Utc::now() + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    pub fn validate(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            tracing::debug!(error = %e, "token validation failed");
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(AuthenticatedUser {
            id: UserId(data.claims.id),
            username: data.claims.username,
        })
    }
}

fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }
    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }
    Ok(token)
}

#[derive(Deserialize)]
struct BearerQuery {
    bearer: Option<String>,
}

/// Validate the request's token and attach the [`AuthenticatedUser`].
///
/// The token comes from `Authorization: Bearer <token>` or, for browsers that
/// cannot set headers on a websocket, the `bearer` query parameter.
pub async fn require_identity(
    State(auth): State<Arc<JwtAuthenticator>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let user = if let Some(header) = header {
        auth.validate(bearer_token_from_header(header)?)?
    } else {
        let query = Query::<BearerQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.bearer)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        auth.validate(&query)?
    };

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
