//! Start-time planning over the live job backlog.
//!
//! The service reads jobs and computes new start dates; writing them back is
//! left to the caller.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::distributor::{DistributionParams, distribute};
use super::runtime::RuntimeEstimator;
use crate::config::JobSchedulerConfig;
use crate::models::DistributionSyncJob;
use crate::repositories::{JobStore, JobStoreError};

/// Number of jobs read per backlog segment.
pub const BACKLOG_SEGMENT_SIZE: u64 = 100;

pub struct JobSchedulingService {
    estimator: Arc<dyn RuntimeEstimator>,
    default_runtime: Duration,
    max_concurrency: usize,
}

impl JobSchedulingService {
    pub fn new(
        estimator: Arc<dyn RuntimeEstimator>,
        default_runtime: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            estimator,
            default_runtime,
            max_concurrency,
        }
    }

    pub fn from_config(estimator: Arc<dyn RuntimeEstimator>, config: &JobSchedulerConfig) -> Self {
        Self::new(
            estimator,
            Duration::seconds(config.default_runtime_seconds as i64),
            config.max_concurrency,
        )
    }

    /// Reads every enabled job segment by segment. Jobs scheduled in the
    /// future are skipped unless `include_future_jobs` is set.
    pub async fn load_backlog(
        &self,
        store: &dyn JobStore,
        now: DateTime<Utc>,
        include_future_jobs: bool,
    ) -> Result<Vec<DistributionSyncJob>, JobStoreError> {
        let mut backlog = Vec::new();
        let mut offset = 0;

        loop {
            let segment = store
                .list_enabled_jobs_page(offset, BACKLOG_SEGMENT_SIZE)
                .await?;
            let fetched = segment.len() as u64;
            backlog.extend(
                segment
                    .iter()
                    .map(DistributionSyncJob::from)
                    .filter(|job| include_future_jobs || job.start_date <= now),
            );
            debug!(offset, fetched, "Loaded job backlog segment");

            if fetched < BACKLOG_SEGMENT_SIZE {
                break;
            }
            offset += fetched;
        }

        Ok(backlog)
    }

    /// Moves stale start dates to `new_base`. A job is stale when its start
    /// date is not after `new_base`; `force_all` resets every job.
    pub fn reset_job_start_times(
        &self,
        jobs: &[DistributionSyncJob],
        new_base: DateTime<Utc>,
        force_all: bool,
    ) -> Vec<DistributionSyncJob> {
        jobs.iter()
            .map(|job| {
                let mut updated = job.clone();
                if force_all || job.start_date <= new_base {
                    updated.start_date = new_base;
                }
                updated
            })
            .collect()
    }

    /// Spreads `jobs` over concurrency lanes starting `start_delay_minutes`
    /// from now.
    pub async fn distribute_job_start_times(
        &self,
        jobs: &[DistributionSyncJob],
        start_delay_minutes: u64,
        buffer_seconds: u64,
    ) -> Vec<DistributionSyncJob> {
        self.distribute_job_start_times_at(jobs, start_delay_minutes, buffer_seconds, Utc::now())
            .await
    }

    pub async fn distribute_job_start_times_at(
        &self,
        jobs: &[DistributionSyncJob],
        start_delay_minutes: u64,
        buffer_seconds: u64,
        now: DateTime<Utc>,
    ) -> Vec<DistributionSyncJob> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let estimates = match self.estimator.estimate(jobs).await {
            Ok(estimates) => estimates,
            Err(err) => {
                warn!(
                    error = %err,
                    default_runtime_seconds = self.default_runtime.num_seconds(),
                    "Runtime history unavailable; using default runtime"
                );
                Default::default()
            }
        };

        let params = DistributionParams {
            start_delay: Duration::minutes(start_delay_minutes as i64),
            buffer: Duration::seconds(buffer_seconds as i64),
            max_concurrency: self.max_concurrency,
        };

        distribute(jobs, now, &params, |job| {
            estimates
                .get(&job.target_office_group_id)
                .copied()
                .unwrap_or(self.default_runtime)
        })
    }

    /// Applies the configured reset and distribution steps to `jobs`.
    pub async fn plan_start_times(
        &self,
        jobs: &[DistributionSyncJob],
        config: &JobSchedulerConfig,
        now: DateTime<Utc>,
        force_all: bool,
    ) -> Vec<DistributionSyncJob> {
        let mut planned = jobs.to_vec();

        if config.reset_jobs {
            let new_base = now + Duration::days(config.days_to_add_for_reset);
            planned = self.reset_job_start_times(&planned, new_base, force_all);
        }

        if config.distribute_jobs {
            planned = self
                .distribute_job_start_times_at(
                    &planned,
                    config.start_time_delay_minutes,
                    config.delay_between_syncs_seconds,
                    now,
                )
                .await;
        }

        info!(
            jobs = planned.len(),
            reset = config.reset_jobs,
            distributed = config.distribute_jobs,
            "Planned job start times"
        );
        planned
    }
}
