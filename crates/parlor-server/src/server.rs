use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parlor_core::rooms::RoomStore;
use parlor_core::users::UserStore;
use parlor_core::{AuthenticatedUser, Broker};
use parlor_telemetry::MetricsRecorder;

use crate::api;
use crate::auth::{self, AuthError, JwtAuthenticator};
use crate::bridge;
use crate::hub::Hub;
use crate::session::{self, SessionConfig};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Read deadline T for every session.
    pub liveness_timeout: Duration,
    /// Largest inbound frame accepted before the connection is dropped.
    pub max_frame_bytes: usize,
    pub outbound_queue: usize,
    pub drain_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            liveness_timeout: Duration::from_secs(10),
            max_frame_bytes: 1000,
            outbound_queue: 64,
            drain_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            liveness_timeout: self.liveness_timeout,
            outbound_queue: self.outbound_queue,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub users: Arc<dyn UserStore>,
    pub auth: Arc<JwtAuthenticator>,
    pub metrics: Arc<MetricsRecorder>,
    pub session: SessionConfig,
    pub max_frame_bytes: usize,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/ws", get(ws_handler))
        .route("/rooms", get(api::list_rooms).post(api::create_room))
        .route("/rooms/{id}/messages", get(api::list_messages))
        .route("/users", get(api::list_users))
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            auth::require_identity,
        ));

    Router::new()
        .merge(authenticated)
        .route("/users", post(api::register))
        .route("/users/login", post(api::login))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Collaborators the server runs on top of.
pub struct Services {
    pub store: Arc<dyn RoomStore>,
    pub users: Arc<dyn UserStore>,
    pub broker: Arc<dyn Broker>,
    pub auth: Arc<JwtAuthenticator>,
    pub metrics: Arc<MetricsRecorder>,
}

/// Start the hub, the broker listener and the HTTP server. Cancelling
/// `shutdown` stops accepting connections and drains the hub.
pub async fn start(
    config: ServerConfig,
    services: Services,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let (hub, control) = Hub::new(
        services.store,
        services.broker,
        Arc::clone(&services.metrics),
        config.publish_timeout,
    );

    let control = tokio::spawn(control.run(shutdown.clone(), config.drain_timeout));
    let listener_task = bridge::create_listener(Arc::clone(&hub), shutdown.clone());

    let app_state = AppState {
        hub: Arc::clone(&hub),
        users: services.users,
        auth: services.auth,
        metrics: services.metrics,
        session: config.session_config(),
        max_frame_bytes: config.max_frame_bytes,
    };
    let router = build_router(app_state);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "parlor server started");

    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "http server failed");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        hub,
        control,
        listener: listener_task,
        server,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    hub: Arc<Hub>,
    control: tokio::task::JoinHandle<()>,
    listener: tokio::task::JoinHandle<()>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Wait for the drain and every background task to finish.
    pub async fn join(self) {
        let _ = self.control.await;
        let _ = self.listener.await;
        let _ = self.server.await;
        tracing::info!("parlor server stopped");
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    user: Option<Extension<AuthenticatedUser>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(Extension(user)) = user else {
        return AuthError::MissingToken.into_response();
    };
    if !state.hub.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    let hub = state.hub;
    let config = state.session;
    ws.max_message_size(state.max_frame_bytes)
        .max_frame_size(state.max_frame_bytes)
        .on_upgrade(move |socket| session::serve(socket, user, hub, config))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, label) = if state.hub.is_accepting() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    };
    (
        status,
        Json(serde_json::json!({
            "status": label,
            "sessions": state.hub.session_count(),
        })),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
