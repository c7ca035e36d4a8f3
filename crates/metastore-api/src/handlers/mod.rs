//! HTTP handlers for metastore-api.

pub mod replay;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::response::IntoResponse;
use axum::Json;

use metastore_core::context::{ACCOUNT_ID, CORRELATION_ID, DATA_PARTITION_ID, USER};
use metastore_core::{defaults, RequestContext};

use crate::error::ApiError;

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Tenant context taken from the request headers.
///
/// `data-partition-id` is required. A missing, blank, or oversized
/// `correlation-id` is replaced by a generated one.
pub struct Tenant(pub RequestContext);

#[async_trait]
impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let partition_id = header(DATA_PARTITION_ID).ok_or_else(|| {
            ApiError::BadRequest(format!("Missing required header {}", DATA_PARTITION_ID))
        })?;

        let mut ctx = RequestContext::new(partition_id);
        if let Some(correlation_id) =
            header(CORRELATION_ID).filter(|c| c.len() <= defaults::CORRELATION_ID_MAX_LEN)
        {
            ctx = ctx.with_correlation_id(correlation_id);
        }
        if let Some(account_id) = header(ACCOUNT_ID) {
            ctx = ctx.with_account_id(account_id);
        }
        if let Some(user) = header(USER) {
            ctx = ctx.with_user(user);
        }
        Ok(Tenant(ctx))
    }
}
