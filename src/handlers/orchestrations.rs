//! # Orchestration API Handlers
//!
//! Manual start of sync orchestrations, either a whole job or one part.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, validation_error};
use crate::models::{JobKey, SyncStatus};
use crate::orchestration::{LaunchOutcome, OrchestrationRequest, OrchestrationState};
use crate::server::AppState;

/// Request body for starting an orchestration
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartOrchestrationRequest {
    #[schema(example = "2026-01-10")]
    pub partition_key: String,
    pub row_key: String,
    /// Runs only this part when set; otherwise every part of the job is launched
    pub current_part: Option<u32>,
    /// Defaults to `current_part`
    pub total_parts: Option<u32>,
    #[serde(default)]
    pub is_destination_part: bool,
    /// Resumes the instance of an existing run
    pub run_id: Option<Uuid>,
}

/// Response payload for an accepted start request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrchestrationAccepted {
    pub run_id: Uuid,
    pub total_parts: u32,
    /// `{run_id}:{part}` of every started instance
    pub instance_ids: Vec<String>,
}

/// Start an orchestration for a sync job
#[utoipa::path(
    post,
    path = "/api/orchestrations",
    request_body = StartOrchestrationRequest,
    responses(
        (status = 202, description = "Orchestration started", body = OrchestrationAccepted),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Sync job not found", body = ApiError),
        (status = 409, description = "Job already running", body = ApiError)
    ),
    tag = "orchestrations"
)]
pub async fn start_orchestration(
    State(state): State<AppState>,
    payload: Result<Json<StartOrchestrationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<OrchestrationAccepted>), ApiError> {
    let Json(request) = payload?;
    if request.partition_key.trim().is_empty() || request.row_key.trim().is_empty() {
        return Err(validation_error(
            "Job key is required",
            serde_json::json!({ "partition_key": request.partition_key, "row_key": request.row_key }),
        ));
    }

    let key = JobKey::new(request.partition_key.clone(), request.row_key.clone());
    let job = state.jobs.get_job(&key).await?.ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            &format!("Sync job {} not found", key),
        )
    })?;

    if let Some(part) = request.current_part {
        // a single part may only join the run that owns the job
        if matches!(job.sync_status(), Ok(SyncStatus::InProgress))
            && let Some(requested) = request.run_id
            && job.run_id != Some(requested)
        {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "CONFLICT",
                &format!(
                    "Sync job {} is running as {}",
                    key,
                    job.run_id.map(|owner| owner.to_string()).unwrap_or_default()
                ),
            ));
        }

        let run_id = request.run_id.or(job.run_id).unwrap_or_else(Uuid::new_v4);
        let total_parts = request.total_parts.unwrap_or(part);
        let workflow = state.launcher.workflow();
        let part_request = OrchestrationRequest {
            job: key.clone(),
            run_id: Some(run_id),
            current_part: part,
            total_parts,
            is_destination_part: request.is_destination_part,
        };
        tokio::spawn(async move {
            if let Err(err) = workflow.run(part_request).await {
                error!(run_id = %run_id, part, error = %err, "Manually started orchestration failed");
            }
        });
        info!(job = %key, run_id = %run_id, part, "Started orchestration part");

        return Ok((
            StatusCode::ACCEPTED,
            Json(OrchestrationAccepted {
                run_id,
                total_parts,
                instance_ids: vec![OrchestrationState::instance_id(run_id, part)],
            }),
        ));
    }

    match state.launcher.launch(&job).await? {
        LaunchOutcome::Launched {
            run_id,
            total_parts,
            ..
        } => Ok((
            StatusCode::ACCEPTED,
            Json(OrchestrationAccepted {
                run_id,
                total_parts,
                instance_ids: (1..=total_parts)
                    .map(|part| OrchestrationState::instance_id(run_id, part))
                    .collect(),
            }),
        )),
        LaunchOutcome::AlreadyRunning { run_id } => Err(ApiError::new(
            StatusCode::CONFLICT,
            "CONFLICT",
            &format!("Sync job {} is already running as {}", key, run_id),
        )),
        LaunchOutcome::LostRace => Err(ApiError::new(
            StatusCode::CONFLICT,
            "CONFLICT",
            &format!("Sync job {} was claimed by another run", key),
        )),
    }
}
