//! Replay operator endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use metastore_core::{ReplayMetaData, ReplayRequest};

use super::Tenant;
use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStarted {
    pub replay_id: Uuid,
}

/// `POST /api/storage/v2/replay`
pub async fn start_replay(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Json(request): Json<ReplayRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let meta = state.replay.start(&ctx, &request).await?;
    info!(
        subsystem = "api",
        component = "replay",
        partition_id = %ctx.partition_id(),
        correlation_id = %ctx.correlation_id(),
        replay_id = %meta.replay_id,
        "Replay accepted"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(ReplayStarted {
            replay_id: meta.replay_id,
        }),
    ))
}

/// `GET /api/storage/v2/replay/status/:id`
pub async fn replay_status(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Path(replay_id): Path<Uuid>,
) -> Result<Json<ReplayMetaData>, ApiError> {
    Ok(Json(state.replay.status(ctx.partition_id(), replay_id).await?))
}

/// `POST /api/storage/v2/replay/:id/stop`
pub async fn stop_replay(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Path(replay_id): Path<Uuid>,
) -> Result<Json<ReplayMetaData>, ApiError> {
    Ok(Json(state.replay.stop(ctx.partition_id(), replay_id).await?))
}
