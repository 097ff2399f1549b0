//! # SyncJob Repository
//!
//! The [`JobStore`] contract used by the scheduler and both workflows, and its
//! SeaORM implementation. Every mutation is a single conditional row write
//! keyed on the row's `version`, so a writer holding a stale copy of a job
//! gets [`JobStoreError::Conflict`] instead of silently overwriting.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    UpdateMany,
};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::distribution::DistributionSyncJob;
use crate::models::status::SyncStatus;
use crate::models::sync_job::{Column, Entity, JobKey, Model};

/// Errors surfaced by [`JobStore`] implementations.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("sync job {key} not found")]
    NotFound { key: JobKey },
    /// The row changed since it was read; another run owns it now.
    #[error("sync job {key} was modified concurrently")]
    Conflict { key: JobKey },
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

/// Field changes applied together with a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusUpdate {
    pub status: SyncStatus,
    pub run_id: Option<Uuid>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub dry_run_time_stamp: Option<DateTime<Utc>>,
    pub threshold_violations: Option<i32>,
}

impl JobStatusUpdate {
    pub fn new(status: SyncStatus) -> Self {
        Self {
            status,
            run_id: None,
            last_run_time: None,
            dry_run_time_stamp: None,
            threshold_violations: None,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Records a finished run: dry runs stamp `dry_run_time_stamp`, real runs
    /// stamp `last_run_time`.
    pub fn with_run_finished(mut self, at: DateTime<Utc>, dry_run: bool) -> Self {
        if dry_run {
            self.dry_run_time_stamp = Some(at);
        } else {
            self.last_run_time = Some(at);
        }
        self
    }

    pub fn with_threshold_violations(mut self, violations: i32) -> Self {
        self.threshold_violations = Some(violations);
        self
    }
}

/// Per-row results of a batch write.
#[derive(Debug, Default)]
pub struct WriteSummary {
    pub updated: Vec<Model>,
    pub conflicts: Vec<JobKey>,
    pub missing: Vec<JobKey>,
}

impl WriteSummary {
    fn record(&mut self, key: JobKey, result: Result<Model, JobStoreError>) -> Result<(), DbErr> {
        match result {
            Ok(model) => self.updated.push(model),
            Err(JobStoreError::Conflict { key }) => {
                warn!(job = %key, "Lost optimistic concurrency race; skipping row");
                self.conflicts.push(key);
            }
            Err(JobStoreError::NotFound { .. }) => self.missing.push(key),
            Err(JobStoreError::Database(err)) => return Err(err),
        }
        Ok(())
    }
}

/// Durable store of sync jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enabled jobs not already in progress whose start date has passed and
    /// whose period has elapsed since the last run.
    async fn list_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Model>, JobStoreError>;

    /// One segment of all enabled jobs, ordered by key.
    async fn list_enabled_jobs_page(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Model>, JobStoreError>;

    /// Jobs claimed by a run that has not written a terminal status yet.
    async fn list_in_progress_jobs(&self) -> Result<Vec<Model>, JobStoreError>;

    async fn get_job(&self, key: &JobKey) -> Result<Option<Model>, JobStoreError>;

    /// Conditionally applies `update` to the row `job` was read from.
    async fn update_job(
        &self,
        job: &Model,
        update: JobStatusUpdate,
    ) -> Result<Model, JobStoreError>;

    /// Sets `status` on every job; races are reported per row, not as an error.
    async fn update_status(
        &self,
        jobs: &[Model],
        status: SyncStatus,
    ) -> Result<WriteSummary, JobStoreError> {
        let mut summary = WriteSummary::default();
        for job in jobs {
            let result = self.update_job(job, JobStatusUpdate::new(status)).await;
            summary.record(job.key(), result)?;
        }
        Ok(summary)
    }

    /// Persists new start dates; races are reported per row.
    async fn update_start_times(
        &self,
        jobs: &[DistributionSyncJob],
    ) -> Result<WriteSummary, JobStoreError>;
}

/// SeaORM-backed [`JobStore`].
#[derive(Clone)]
pub struct SyncJobRepository {
    db: Arc<DatabaseConnection>,
}

impl SyncJobRepository {
    /// Create a new SyncJobRepository with the given database connection
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn conditional_update(key: &JobKey, version: i32, now: DateTime<Utc>) -> UpdateMany<Entity> {
        Entity::update_many()
            .col_expr(Column::Version, Expr::col(Column::Version).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::PartitionKey.eq(key.partition_key.as_str()))
            .filter(Column::RowKey.eq(key.row_key.as_str()))
            .filter(Column::Version.eq(version))
    }

    /// Distinguishes a lost race from a deleted row after a zero-row update.
    async fn classify_miss(&self, key: JobKey) -> JobStoreError {
        match self.get_job(&key).await {
            Ok(Some(_)) => JobStoreError::Conflict { key },
            Ok(None) => JobStoreError::NotFound { key },
            Err(err) => err,
        }
    }

    async fn reload(&self, key: JobKey) -> Result<Model, JobStoreError> {
        match self.get_job(&key).await? {
            Some(model) => Ok(model),
            None => Err(JobStoreError::NotFound { key }),
        }
    }
}

#[async_trait]
impl JobStore for SyncJobRepository {
    async fn list_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Model>, JobStoreError> {
        let candidates = Entity::find()
            .filter(Column::Enabled.eq(true))
            .filter(Column::Status.ne(SyncStatus::InProgress.as_str()))
            .filter(Column::StartDate.lte(to_db_time(now)))
            .order_by_asc(Column::StartDate)
            .all(self.db.as_ref())
            .await?;

        let total = candidates.len();
        let due: Vec<Model> = candidates
            .into_iter()
            .filter(|job| period_elapsed(job, now))
            .collect();

        debug!(candidates = total, due = due.len(), "Loaded due sync jobs");
        Ok(due)
    }

    async fn list_enabled_jobs_page(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Model>, JobStoreError> {
        Ok(Entity::find()
            .filter(Column::Enabled.eq(true))
            .order_by_asc(Column::PartitionKey)
            .order_by_asc(Column::RowKey)
            .offset(offset)
            .limit(limit)
            .all(self.db.as_ref())
            .await?)
    }

    async fn list_in_progress_jobs(&self) -> Result<Vec<Model>, JobStoreError> {
        Ok(Entity::find()
            .filter(Column::Status.eq(SyncStatus::InProgress.as_str()))
            .order_by_asc(Column::PartitionKey)
            .order_by_asc(Column::RowKey)
            .all(self.db.as_ref())
            .await?)
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<Model>, JobStoreError> {
        Ok(
            Entity::find_by_id((key.partition_key.clone(), key.row_key.clone()))
                .one(self.db.as_ref())
                .await?,
        )
    }

    async fn update_job(
        &self,
        job: &Model,
        update: JobStatusUpdate,
    ) -> Result<Model, JobStoreError> {
        let key = job.key();
        let mut stmt = Self::conditional_update(&key, job.version, Utc::now())
            .col_expr(Column::Status, Expr::value(update.status.as_str()));

        if update.status.disables_job() {
            stmt = stmt.col_expr(Column::Enabled, Expr::value(false));
        }
        if let Some(run_id) = update.run_id {
            stmt = stmt.col_expr(Column::RunId, Expr::value(run_id));
        }
        if let Some(at) = update.last_run_time {
            stmt = stmt.col_expr(Column::LastRunTime, Expr::value(to_db_time(at)));
        }
        if let Some(at) = update.dry_run_time_stamp {
            stmt = stmt.col_expr(Column::DryRunTimeStamp, Expr::value(to_db_time(at)));
        }
        if let Some(violations) = update.threshold_violations {
            stmt = stmt.col_expr(Column::ThresholdViolations, Expr::value(violations));
        }

        let result = stmt.exec(self.db.as_ref()).await?;
        if result.rows_affected == 0 {
            return Err(self.classify_miss(key).await);
        }

        debug!(job = %key, status = %update.status, "Sync job status updated");
        self.reload(key).await
    }

    async fn update_start_times(
        &self,
        jobs: &[DistributionSyncJob],
    ) -> Result<WriteSummary, JobStoreError> {
        let mut summary = WriteSummary::default();
        let now = Utc::now();

        for job in jobs {
            let key = job.key();
            let result = Self::conditional_update(&key, job.version, now)
                .col_expr(Column::StartDate, Expr::value(to_db_time(job.start_date)))
                .exec(self.db.as_ref())
                .await?;

            let outcome = if result.rows_affected == 0 {
                Err(self.classify_miss(key.clone()).await)
            } else {
                self.reload(key.clone()).await
            };
            summary.record(key, outcome)?;
        }

        Ok(summary)
    }
}

/// A job is due again once `period` hours have passed since its last run,
/// real or dry.
fn period_elapsed(job: &Model, now: DateTime<Utc>) -> bool {
    let last = [job.last_run_time, job.dry_run_time_stamp]
        .into_iter()
        .flatten()
        .max();
    match last {
        Some(last) => last.with_timezone(&Utc) + Duration::hours(i64::from(job.period)) <= now,
        None => true,
    }
}

pub(crate) fn to_db_time(dt: DateTime<Utc>) -> DateTime<FixedOffset> {
    dt.fixed_offset()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(last_run_time: Option<DateTime<Utc>>, period: i32) -> Model {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Model {
            partition_key: "2025-01-01".to_string(),
            row_key: Uuid::new_v4().to_string(),
            target_office_group_id: Uuid::new_v4(),
            query: Uuid::new_v4().to_string(),
            period,
            start_date: created.fixed_offset(),
            last_run_time: last_run_time.map(|dt| dt.fixed_offset()),
            dry_run_time_stamp: None,
            enabled: true,
            is_dry_run_enabled: false,
            status: "Idle".to_string(),
            threshold_percentage_for_additions: 100,
            threshold_percentage_for_removals: 10,
            threshold_violations: 0,
            requestor: "owner@example.com".to_string(),
            run_id: None,
            version: 0,
            created_at: created.fixed_offset(),
            updated_at: created.fixed_offset(),
        }
    }

    #[test]
    fn never_run_jobs_are_due() {
        assert!(period_elapsed(&job(None, 24), Utc::now()));
    }

    #[test]
    fn period_gates_reruns() {
        let now = Utc::now();
        assert!(!period_elapsed(&job(Some(now - Duration::hours(5)), 6), now));
        assert!(period_elapsed(&job(Some(now - Duration::hours(6)), 6), now));
    }

    #[test]
    fn dry_runs_gate_reruns_too() {
        let now = Utc::now();
        let mut dry = job(None, 24);
        dry.is_dry_run_enabled = true;
        dry.dry_run_time_stamp = Some((now - Duration::minutes(1)).fixed_offset());
        assert!(!period_elapsed(&dry, now));

        dry.last_run_time = Some((now - Duration::days(3)).fixed_offset());
        assert!(!period_elapsed(&dry, now));
        assert!(period_elapsed(&dry, now + Duration::hours(24)));
    }

    #[test]
    fn run_finished_stamps_the_matching_timestamp() {
        let at = Utc::now();
        let real = JobStatusUpdate::new(SyncStatus::Idle).with_run_finished(at, false);
        assert_eq!(real.last_run_time, Some(at));
        assert_eq!(real.dry_run_time_stamp, None);

        let dry = JobStatusUpdate::new(SyncStatus::Idle).with_run_finished(at, true);
        assert_eq!(dry.last_run_time, None);
        assert_eq!(dry.dry_run_time_stamp, Some(at));
    }
}
