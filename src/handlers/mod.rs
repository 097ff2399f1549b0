//! # API Handlers
//!
//! This module contains all the HTTP endpoint handlers for the sync service.

use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db;
use crate::error::ApiError;
use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod aggregator;
pub mod orchestrations;

/// Health check response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// `ok` when the database answers
    #[schema(example = "ok")]
    pub status: String,
    /// Orchestration instances currently driven by this process
    pub orchestrations_in_flight: usize,
    /// Aggregation sessions waiting for their last part
    pub open_sessions: usize,
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Database and worker health
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Database unavailable", body = ApiError)
    ),
    tag = "root"
)]
pub async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    db::health_check(state.db.as_ref()).await.map_err(|err| {
        tracing::error!(error = ?err, "Health check failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Database service unavailable",
        )
        .with_retry_after(5)
    })?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        orchestrations_in_flight: state.launcher.in_flight_count(),
        open_sessions: state.aggregator.open_sessions(),
    }))
}
