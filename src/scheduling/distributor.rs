//! Start-time distribution across concurrency lanes.
//!
//! Jobs are grouped by period and each group is laid out independently:
//! oldest start dates first, dealt round-robin into `max_concurrency` lanes.
//! Every lane opens at `now + start_delay`; each later job in a lane starts
//! after its predecessor's estimated runtime plus the buffer.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::DistributionSyncJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionParams {
    pub start_delay: Duration,
    pub buffer: Duration,
    /// Values below one are treated as one
    pub max_concurrency: usize,
}

/// Returns re-timed copies of `jobs`, ordered by period then new start date.
pub fn distribute<F>(
    jobs: &[DistributionSyncJob],
    now: DateTime<Utc>,
    params: &DistributionParams,
    runtime_estimate: F,
) -> Vec<DistributionSyncJob>
where
    F: Fn(&DistributionSyncJob) -> Duration,
{
    let lanes = params.max_concurrency.max(1);
    let first_start = now + params.start_delay;

    let mut by_period: BTreeMap<i32, Vec<&DistributionSyncJob>> = BTreeMap::new();
    for job in jobs {
        by_period.entry(job.period).or_default().push(job);
    }

    let mut distributed = Vec::with_capacity(jobs.len());
    for (_, mut group) in by_period {
        // Stable, so equal start dates keep input order
        group.sort_by_key(|job| job.start_date);

        let mut lane_next = vec![first_start; lanes];
        for (position, job) in group.into_iter().enumerate() {
            let lane = position % lanes;
            let mut retimed = job.clone();
            retimed.start_date = lane_next[lane];

            let runtime = runtime_estimate(job).max(Duration::zero());
            lane_next[lane] = retimed.start_date + runtime + params.buffer;
            distributed.push(retimed);
        }
    }

    distributed
}
