//! # Membership Aggregator Handler
//!
//! Receives membership parts produced by orchestration instances.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::{ApiError, unauthorized};
use crate::orchestration::{FUNCTION_KEY_HEADER, MembershipAggregatorRequest};
use crate::server::AppState;

/// Accept one membership part for aggregation
#[utoipa::path(
    post,
    path = "/api/membership-aggregator",
    request_body = MembershipAggregatorRequest,
    params(
        ("x-functions-key" = Option<String>, Header, description = "Shared aggregation key, when configured")
    ),
    responses(
        (status = 204, description = "Part accepted"),
        (status = 400, description = "Invalid part or unreadable payload", body = ApiError),
        (status = 401, description = "Missing or wrong function key", body = ApiError)
    ),
    tag = "aggregation"
)]
pub async fn receive_membership_part(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<MembershipAggregatorRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    if let Some(expected) = state.config.aggregator.function_key.as_deref() {
        let provided = headers
            .get(FUNCTION_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(unauthorized(Some("Invalid function key")));
        }
    }

    let Json(request) = payload?;
    let receipt = state.aggregator.receive_part(&request).await?;
    debug!(receipt = ?receipt, "Membership part processed");
    Ok(StatusCode::NO_CONTENT)
}
