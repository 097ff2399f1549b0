//! Orchestration checkpoint persistence.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use thiserror::Error;
use uuid::Uuid;

use super::sync_job::to_db_time;
use crate::models::orchestration_checkpoint::{ActiveModel, Column, Entity};
use crate::orchestration::state::{OrchestrationState, Phase};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("checkpoint {instance_id} is unreadable: {reason}")]
    Corrupt { instance_id: String, reason: String },
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, instance_id: &str) -> Result<Option<OrchestrationState>, CheckpointError>;

    /// Inserts or replaces the checkpoint of `state.instance_id`.
    async fn save(&self, state: &OrchestrationState) -> Result<(), CheckpointError>;

    /// Every checkpointed instance of `run_id`, ordered by part.
    async fn load_run(&self, run_id: Uuid) -> Result<Vec<OrchestrationState>, CheckpointError>;

    /// Durations of the latest completed instances for a destination group,
    /// newest first.
    async fn recent_runtimes(
        &self,
        target_group_id: Uuid,
        limit: u64,
    ) -> Result<Vec<Duration>, CheckpointError>;
}

#[derive(Clone)]
pub struct CheckpointRepository {
    db: Arc<DatabaseConnection>,
}

impl CheckpointRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointStore for CheckpointRepository {
    async fn load(&self, instance_id: &str) -> Result<Option<OrchestrationState>, CheckpointError> {
        let Some(row) = Entity::find_by_id(instance_id.to_string())
            .one(self.db.as_ref())
            .await?
        else {
            return Ok(None);
        };

        serde_json::from_value(row.state)
            .map(Some)
            .map_err(|err| CheckpointError::Corrupt {
                instance_id: instance_id.to_string(),
                reason: err.to_string(),
            })
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Vec<OrchestrationState>, CheckpointError> {
        let rows = Entity::find()
            .filter(Column::RunId.eq(run_id))
            .order_by_asc(Column::CurrentPart)
            .all(self.db.as_ref())
            .await?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row.state).map_err(|err| CheckpointError::Corrupt {
                    instance_id: row.instance_id.clone(),
                    reason: err.to_string(),
                })
            })
            .collect()
    }

    async fn save(&self, state: &OrchestrationState) -> Result<(), CheckpointError> {
        let row = ActiveModel {
            instance_id: Set(state.instance_id.clone()),
            run_id: Set(state.run_id),
            partition_key: Set(state.job.partition_key.clone()),
            row_key: Set(state.job.row_key.clone()),
            target_office_group_id: Set(Some(state.target_group_id)),
            current_part: Set(state.current_part as i32),
            phase: Set(state.phase.as_str().to_string()),
            state: Set(serde_json::to_value(state)?),
            started_at: Set(to_db_time(state.started_at)),
            updated_at: Set(to_db_time(Utc::now())),
            completed_at: Set(state.finished_at.map(to_db_time)),
        };

        Entity::insert(row)
            .on_conflict(
                OnConflict::column(Column::InstanceId)
                    .update_columns([
                        Column::Phase,
                        Column::State,
                        Column::UpdatedAt,
                        Column::CompletedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn recent_runtimes(
        &self,
        target_group_id: Uuid,
        limit: u64,
    ) -> Result<Vec<Duration>, CheckpointError> {
        let rows = Entity::find()
            .filter(Column::TargetOfficeGroupId.eq(target_group_id))
            .filter(Column::Phase.eq(Phase::Completed.as_str()))
            .filter(Column::CompletedAt.is_not_null())
            .order_by_desc(Column::CompletedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.completed_at.map(|done| done - row.started_at))
            .collect())
    }
}
