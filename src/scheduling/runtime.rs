//! Expected runtime per job, used to space start times within a lane.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::models::DistributionSyncJob;
use crate::repositories::{CheckpointError, CheckpointStore};

/// Number of completed runs averaged per destination group.
const HISTORY_DEPTH: u64 = 5;

#[async_trait]
pub trait RuntimeEstimator: Send + Sync {
    /// Estimates keyed by destination group id. Groups without an entry use
    /// the caller's default.
    async fn estimate(
        &self,
        jobs: &[DistributionSyncJob],
    ) -> Result<HashMap<Uuid, Duration>, CheckpointError>;
}

/// Every job takes the same configured time.
#[derive(Debug, Clone, Copy)]
pub struct FixedRuntimeEstimator {
    runtime: Duration,
}

impl FixedRuntimeEstimator {
    pub fn new(runtime: Duration) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl RuntimeEstimator for FixedRuntimeEstimator {
    async fn estimate(
        &self,
        jobs: &[DistributionSyncJob],
    ) -> Result<HashMap<Uuid, Duration>, CheckpointError> {
        Ok(jobs
            .iter()
            .map(|job| (job.target_office_group_id, self.runtime))
            .collect())
    }
}

/// Averages the most recent completed orchestrations of each destination group.
pub struct HistoricalRuntimeEstimator {
    checkpoints: Arc<dyn CheckpointStore>,
}

impl HistoricalRuntimeEstimator {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self { checkpoints }
    }
}

#[async_trait]
impl RuntimeEstimator for HistoricalRuntimeEstimator {
    async fn estimate(
        &self,
        jobs: &[DistributionSyncJob],
    ) -> Result<HashMap<Uuid, Duration>, CheckpointError> {
        let mut estimates = HashMap::new();
        for job in jobs {
            let group = job.target_office_group_id;
            if estimates.contains_key(&group) {
                continue;
            }
            let history = self.checkpoints.recent_runtimes(group, HISTORY_DEPTH).await?;
            if history.is_empty() {
                continue;
            }
            let total = history
                .iter()
                .fold(Duration::zero(), |acc, runtime| acc + *runtime);
            estimates.insert(group, total / history.len() as i32);
        }
        Ok(estimates)
    }
}
