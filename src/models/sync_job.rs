//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the sync_jobs table,
//! which holds one recurring membership sync per `(partition_key, row_key)`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{SyncStatus, UnknownSyncStatus};

/// SyncJob entity representing one configured membership sync
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    /// Partition half of the composite job identity
    #[sea_orm(primary_key, auto_increment = false)]
    pub partition_key: String,

    /// Row half of the composite job identity
    #[sea_orm(primary_key, auto_increment = false)]
    pub row_key: String,

    /// Destination group whose membership is kept in sync
    pub target_office_group_id: Uuid,

    /// Source group query (`id;id` or a JSON array of parts)
    pub query: String,

    /// Recurrence period in hours
    pub period: i32,

    /// Next scheduled start
    pub start_date: DateTimeWithTimeZone,

    /// Timestamp of the last applied (non dry-run) sync
    pub last_run_time: Option<DateTimeWithTimeZone>,

    /// Timestamp of the last dry-run sync
    pub dry_run_time_stamp: Option<DateTimeWithTimeZone>,

    /// Disabled jobs are never scheduled
    pub enabled: bool,

    /// Per-job dry-run switch
    pub is_dry_run_enabled: bool,

    /// Current status, see [`SyncStatus`]
    pub status: String,

    /// Maximum allowed additions as a percentage of current membership, -1 disables
    pub threshold_percentage_for_additions: i32,

    /// Maximum allowed removals as a percentage of current membership, -1 disables
    pub threshold_percentage_for_removals: i32,

    /// Number of consecutive runs rejected by the threshold check
    pub threshold_violations: i32,

    /// Address notified about threshold and configuration problems
    pub requestor: String,

    /// Correlation id of the active (or last) run
    pub run_id: Option<Uuid>,

    /// Optimistic concurrency token, bumped on every write
    pub version: i32,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Composite identity of this job.
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.partition_key, &self.row_key)
    }

    /// Parsed status column.
    pub fn sync_status(&self) -> Result<SyncStatus, UnknownSyncStatus> {
        self.status.parse()
    }
}

/// Composite `(partition_key, row_key)` identity of a sync job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub partition_key: String,
    pub row_key: String,
}

impl JobKey {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.row_key)
    }
}
