//! # Data Models
//!
//! This module contains the persisted entities and the in-memory domain types
//! shared by the scheduling, orchestration and aggregation stages.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod backup_tracker;
pub mod distribution;
pub mod membership;
pub mod orchestration_checkpoint;
pub mod status;
pub mod sync_job;

pub use backup_tracker::Entity as BackupTracker;
pub use distribution::DistributionSyncJob;
pub use membership::{AzureAdGroup, AzureAdUser, GroupMembership};
pub use orchestration_checkpoint::Entity as OrchestrationCheckpoint;
pub use status::SyncStatus;
pub use sync_job::{Entity as SyncJob, JobKey};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "groupsync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
