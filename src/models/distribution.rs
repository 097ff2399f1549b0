//! Scheduling projection of a sync job.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sync_job::{JobKey, Model as SyncJobModel};

/// The subset of a [`SyncJobModel`] the start-time distributor works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionSyncJob {
    pub partition_key: String,
    pub row_key: String,
    pub target_office_group_id: Uuid,
    /// Recurrence period in hours
    pub period: i32,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub last_run_time: Option<DateTime<Utc>>,
    /// Concurrency token of the row this projection was read from
    pub version: i32,
}

impl DistributionSyncJob {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.partition_key, &self.row_key)
    }

    /// Orders by period first, then by start date.
    pub fn schedule_cmp(&self, other: &Self) -> Ordering {
        self.period
            .cmp(&other.period)
            .then_with(|| self.start_date.cmp(&other.start_date))
    }
}

impl From<&SyncJobModel> for DistributionSyncJob {
    fn from(job: &SyncJobModel) -> Self {
        Self {
            partition_key: job.partition_key.clone(),
            row_key: job.row_key.clone(),
            target_office_group_id: job.target_office_group_id,
            period: job.period,
            status: job.status.clone(),
            start_date: job.start_date.with_timezone(&Utc),
            last_run_time: job.last_run_time.map(|dt| dt.with_timezone(&Utc)),
            version: job.version,
        }
    }
}
