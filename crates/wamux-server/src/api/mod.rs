//! HTTP surface: session management, message sending and media serving.

pub mod error;
pub mod handlers;

use crate::session::SessionManager;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Request bodies carry base64 media, so the default 2 MiB is too small.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    /// When set, every `/api` request must present it in `X-API-Key`.
    pub api_key: Option<Arc<str>>,
    pub connect_wait: Duration,
    pub qr_wait: Duration,
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = state.api_key.as_deref() {
        let presented = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            return error::ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    next.run(req).await
}

/// Build the full router. Media files under `media_dir` are served at
/// `media_prefix`.
pub fn router(state: AppState, media_dir: &Path, media_prefix: &str) -> Router {
    let api = Router::new()
        .route(
            "/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route(
            "/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/sessions/{id}/connect", post(handlers::connect_session))
        .route("/sessions/{id}/qr", get(handlers::get_qr))
        .route("/sessions/{id}/disconnect", post(handlers::disconnect_session))
        .route("/sessions/{id}/send/text", post(handlers::send_text))
        .route("/sessions/{id}/send/image", post(handlers::send_image))
        .route("/sessions/{id}/send/document", post(handlers::send_document))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let mut app = Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api);

    let prefix = media_prefix.trim_end_matches('/');
    if prefix.starts_with('/') && prefix.len() > 1 {
        app = app.nest_service(prefix, ServeDir::new(media_dir));
    }

    app.layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
