//! Applies a merged membership to its destination group.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::AggregationError;
use super::collector::MergedMembership;
use crate::delta::{DeltaResult, compute_delta};
use crate::directory::{DirectoryMembershipProvider, DryRunGroupWriter, GroupWriter};
use crate::models::sync_job::Model as SyncJobModel;
use crate::models::{AzureAdUser, JobKey, SyncStatus};
use crate::notifications::{NotificationSender, SYNC_THRESHOLD_DECREASE, SYNC_THRESHOLD_INCREASE};
use crate::orchestration::collector::{CollectionOutcome, collect_group};
use crate::repositories::{JobStatusUpdate, JobStore, JobStoreError};
use crate::retry::{RetryPolicy, retry_transient};
use crate::telemetry::{RunContext, with_run_context};

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied {
        added: usize,
        removed: usize,
        dry_run: bool,
    },
    /// Nothing was applied; the requestor was notified.
    ThresholdExceeded {
        additions: usize,
        removals: usize,
        violations: i32,
    },
    DestinationMissing,
    JobMissing,
    /// Only the destination part arrived; nothing was applied.
    NoSourceParts,
}

/// Consumer of completed sessions.
#[async_trait]
pub trait MembershipUpdater: Send + Sync {
    async fn apply(&self, merged: &MergedMembership) -> Result<UpdateOutcome, AggregationError>;

    /// Marks the job of an abandoned session as errored.
    async fn fail_session(
        &self,
        job: &JobKey,
        run_id: Uuid,
        reason: &str,
    ) -> Result<(), AggregationError>;
}

pub struct GraphUpdater {
    jobs: Arc<dyn JobStore>,
    directory: Arc<dyn DirectoryMembershipProvider>,
    writer: Arc<dyn GroupWriter>,
    notifier: Arc<dyn NotificationSender>,
    retry: RetryPolicy,
    dry_run: bool,
}

impl GraphUpdater {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        directory: Arc<dyn DirectoryMembershipProvider>,
        writer: Arc<dyn GroupWriter>,
        notifier: Arc<dyn NotificationSender>,
        retry: RetryPolicy,
        dry_run: bool,
    ) -> Self {
        Self {
            jobs,
            directory,
            writer,
            notifier,
            retry,
            dry_run,
        }
    }

    async fn sync(&self, merged: &MergedMembership) -> Result<UpdateOutcome, AggregationError> {
        let run_id = merged.run_id;
        let group_id = merged.destination.object_id;

        let Some(job) = self.jobs.get_job(&merged.job).await? else {
            warn!(run_id = %run_id, job = %merged.job, "Sync job not found; dropping merged membership");
            return Ok(UpdateOutcome::JobMissing);
        };

        if merged.source_parts == 0 {
            error!(
                run_id = %run_id,
                group_id = %group_id,
                parts = merged.parts,
                "Session has no source part; refusing to sync destination group {}",
                group_id
            );
            self.write_status(&job, JobStatusUpdate::new(SyncStatus::Error).with_run_id(run_id))
                .await?;
            return Ok(UpdateOutcome::NoSourceParts);
        }

        let exists = retry_transient(&self.retry, run_id, "group_exists", || {
            self.directory.group_exists(group_id)
        })
        .await?;
        if !exists {
            error!(run_id = %run_id, group_id = %group_id, "Group with ID {} doesn't exist.", group_id);
            self.write_status(&job, JobStatusUpdate::new(SyncStatus::Error).with_run_id(run_id))
                .await?;
            return Ok(UpdateOutcome::DestinationMissing);
        }

        let destination = match &merged.destination_members {
            Some(members) => members.clone(),
            None => match collect_group(Arc::clone(&self.directory), self.retry, run_id, group_id)
                .await?
            {
                CollectionOutcome::Collected(collection) => collection.users,
                CollectionOutcome::GroupNotFound(_) => {
                    error!(run_id = %run_id, group_id = %group_id, "Group with ID {} doesn't exist.", group_id);
                    self.write_status(
                        &job,
                        JobStatusUpdate::new(SyncStatus::Error).with_run_id(run_id),
                    )
                    .await?;
                    return Ok(UpdateOutcome::DestinationMissing);
                }
            },
        };

        let delta = compute_delta(
            &destination,
            &merged.source_members,
            job.threshold_percentage_for_additions,
            job.threshold_percentage_for_removals,
        );
        info!(
            run_id = %run_id,
            group_id = %group_id,
            destination_members = destination.len(),
            source_members = merged.source_members.len(),
            to_add = delta.to_add.len(),
            to_remove = delta.to_remove.len(),
            addition_percentage = ?delta.addition_percentage,
            removal_percentage = ?delta.removal_percentage,
            "Calculated membership delta"
        );

        if delta.is_rejected() {
            return self.reject(&job, &delta, run_id).await;
        }

        let dry_run = job.is_dry_run_enabled || self.dry_run || merged.dry_run;
        let writer: &dyn GroupWriter = if dry_run {
            &DryRunGroupWriter
        } else {
            self.writer.as_ref()
        };
        if !delta.to_add.is_empty() {
            writer
                .add_members(merged.destination, &delta.to_add, run_id)
                .await?;
        }
        if !delta.to_remove.is_empty() {
            writer
                .remove_members(merged.destination, &delta.to_remove, run_id)
                .await?;
        }

        if dry_run {
            info!(run_id = %run_id, "Dry Run of a sync to {} is complete. Membership will not be updated.", group_id);
        } else {
            info!(run_id = %run_id, "Syncing to {} done.", group_id);
        }
        counter!("membership_syncs_applied_total", "dry_run" => dry_run.to_string()).increment(1);

        self.write_status(
            &job,
            JobStatusUpdate::new(SyncStatus::Idle)
                .with_run_id(run_id)
                .with_run_finished(Utc::now(), dry_run)
                .with_threshold_violations(0),
        )
        .await?;

        Ok(UpdateOutcome::Applied {
            added: delta.to_add.len(),
            removed: delta.to_remove.len(),
            dry_run,
        })
    }

    async fn reject(
        &self,
        job: &SyncJobModel,
        delta: &DeltaResult,
        run_id: Uuid,
    ) -> Result<UpdateOutcome, AggregationError> {
        let violations = job.threshold_violations + 1;

        if delta.outcome.additions_exceeded() {
            let params = threshold_params(
                job,
                &delta.to_add,
                delta.addition_percentage,
                job.threshold_percentage_for_additions,
                violations,
            );
            self.notifier
                .send(SYNC_THRESHOLD_INCREASE, &job.requestor, &[], &params, run_id)
                .await?;
        }
        if delta.outcome.removals_exceeded() {
            let params = threshold_params(
                job,
                &delta.to_remove,
                delta.removal_percentage,
                job.threshold_percentage_for_removals,
                violations,
            );
            self.notifier
                .send(SYNC_THRESHOLD_DECREASE, &job.requestor, &[], &params, run_id)
                .await?;
        }

        warn!(
            run_id = %run_id,
            group_id = %job.target_office_group_id,
            outcome = ?delta.outcome,
            violations,
            "Threshold exceeded, no changes made to group"
        );
        counter!("membership_threshold_violations_total").increment(1);

        self.write_status(
            job,
            JobStatusUpdate::new(SyncStatus::Idle)
                .with_run_id(run_id)
                .with_threshold_violations(violations),
        )
        .await?;

        Ok(UpdateOutcome::ThresholdExceeded {
            additions: delta.to_add.len(),
            removals: delta.to_remove.len(),
            violations,
        })
    }

    /// Conditional write; losing the race to another run is not an error.
    async fn write_status(
        &self,
        job: &SyncJobModel,
        update: JobStatusUpdate,
    ) -> Result<(), AggregationError> {
        match self.jobs.update_job(job, update).await {
            Ok(_) => Ok(()),
            Err(JobStoreError::Conflict { key }) => {
                warn!(job = %key, "Sync job changed during aggregation; status not updated");
                counter!("job_ownership_conflicts_total").increment(1);
                Ok(())
            }
            Err(JobStoreError::NotFound { key }) => {
                warn!(job = %key, "Sync job removed during aggregation");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn mark_errored(&self, key: &JobKey, run_id: Uuid) -> Result<(), AggregationError> {
        match self.jobs.get_job(key).await? {
            Some(job) => {
                self.write_status(
                    &job,
                    JobStatusUpdate::new(SyncStatus::Error).with_run_id(run_id),
                )
                .await
            }
            None => Ok(()),
        }
    }
}

fn threshold_params(
    job: &SyncJobModel,
    users: &[AzureAdUser],
    percentage: Option<f64>,
    threshold: i32,
    violations: i32,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "destinationGroupId".to_string(),
            job.target_office_group_id.to_string(),
        ),
        ("count".to_string(), users.len().to_string()),
        (
            "percentage".to_string(),
            format!("{:.0}", percentage.unwrap_or_default()),
        ),
        ("threshold".to_string(), threshold.to_string()),
        ("violations".to_string(), violations.to_string()),
    ])
}

#[async_trait]
impl MembershipUpdater for GraphUpdater {
    async fn apply(&self, merged: &MergedMembership) -> Result<UpdateOutcome, AggregationError> {
        let run_id = merged.run_id;
        let context = RunContext {
            run_id,
            current_part: None,
        };
        let span = info_span!("graph_updater", run_id = %run_id, job = %merged.job);

        with_run_context(context, async {
            match self.sync(merged).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    error!(
                        run_id = %run_id,
                        error = %err,
                        "Caught unexpected exception, marking sync job as errored."
                    );
                    counter!("graph_updater_failures_total").increment(1);
                    if let Err(update_err) = self.mark_errored(&merged.job, run_id).await {
                        error!(run_id = %run_id, error = %update_err, "Failed to mark sync job as errored");
                    }
                    Err(err)
                }
            }
        })
        .instrument(span)
        .await
    }

    async fn fail_session(
        &self,
        job: &JobKey,
        run_id: Uuid,
        reason: &str,
    ) -> Result<(), AggregationError> {
        error!(run_id = %run_id, job = %job, reason, "Abandoning membership session");
        self.mark_errored(job, run_id).await
    }
}
