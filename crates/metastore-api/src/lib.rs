//! # metastore-api
//!
//! HTTP surface and process wiring for metastore.
//!
//! - [`config`]: process-level settings
//! - [`handlers`]: replay operator endpoints and health
//! - [`error`]: error to status code mapping

pub mod config;
pub mod error;
pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use metastore_jobs::ReplayOrchestrator;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub replay: ReplayOrchestrator,
}

/// Generates time-ordered UUIDv7 request ids.
#[derive(Clone, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = metastore_core::new_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/storage/v2/replay", post(handlers::replay::start_replay))
        .route(
            "/api/storage/v2/replay/status/:id",
            get(handlers::replay::replay_status),
        )
        .route(
            "/api/storage/v2/replay/:id/stop",
            post(handlers::replay::stop_replay),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}
