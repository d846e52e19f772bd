pub mod api;
pub mod auth;
pub mod bridge;
pub mod error;
mod handlers;
pub mod hub;
pub mod server;
pub mod session;

pub use api::{ApiError, ApiResult};
pub use auth::{AuthError, JwtAuthenticator};
pub use error::HubError;
pub use hub::Hub;
pub use server::{start, ServerConfig, ServerHandle, Services};
