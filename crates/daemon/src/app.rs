use std::sync::Arc;

use axum::Router;
use axum::http::{Method, header};
use axum::routing::get;
use tg_relay_core::{AccessToken, RelayOptions, SessionSlot};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionSlot>,
    pub token: Arc<AccessToken>,
    pub relay: RelayOptions,
}

impl AppState {
    pub fn new(session: Arc<SessionSlot>, token: AccessToken, relay: RelayOptions) -> Self {
        Self {
            session,
            token: Arc::new(token),
            relay,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            header::ACCEPT_RANGES,
            header::CONTENT_DISPOSITION,
            header::CONTENT_LENGTH,
            header::CONTENT_RANGE,
        ]);

    Router::new()
        .route("/", get(handlers::index))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/stream-telegram-video", get(handlers::stream_video))
        .route("/download-telegram-video", get(handlers::download_video))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
