//! Backup housekeeping for persisted tables.
//!
//! A pass snapshots every source table into blob storage, records a tracker
//! row, compares the row count with the previous snapshot and deletes
//! snapshots past retention.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use sea_orm::{DatabaseConnection, DbErr, EntityTrait, QueryOrder};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::BackupConfig;
use crate::models::sync_job::{Column, Entity as SyncJobEntity};
use crate::repositories::BackupTrackerRepository;
use crate::storage::{BlobStore, StorageError};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to encode snapshot of {source_table}: {source}")]
    Encode {
        source_table: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A table that can be snapshotted.
#[async_trait]
pub trait BackupSource: Send + Sync {
    /// Table name, e.g. `sync_jobs`
    fn name(&self) -> &str;

    async fn snapshot(&self) -> Result<Vec<serde_json::Value>, BackupError>;
}

pub struct SyncJobsBackupSource {
    db: Arc<DatabaseConnection>,
}

impl SyncJobsBackupSource {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BackupSource for SyncJobsBackupSource {
    fn name(&self) -> &str {
        "sync_jobs"
    }

    async fn snapshot(&self) -> Result<Vec<serde_json::Value>, BackupError> {
        let rows = SyncJobEntity::find()
            .order_by_asc(Column::PartitionKey)
            .order_by_asc(Column::RowKey)
            .all(self.db.as_ref())
            .await?;
        rows.iter()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()
            .map_err(|source| BackupError::Encode {
                source_table: self.name().to_string(),
                source,
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupReport {
    pub source_table: String,
    pub backup_name: String,
    pub location: String,
    pub row_count: i64,
    pub previous_row_count: Option<i64>,
    /// Snapshots removed by retention
    pub deleted: Vec<String>,
}

pub struct BackupService {
    sources: Vec<Arc<dyn BackupSource>>,
    blobs: Arc<dyn BlobStore>,
    trackers: BackupTrackerRepository,
    config: BackupConfig,
}

impl BackupService {
    pub fn new(
        sources: Vec<Arc<dyn BackupSource>>,
        blobs: Arc<dyn BlobStore>,
        trackers: BackupTrackerRepository,
        config: BackupConfig,
    ) -> Self {
        Self {
            sources,
            blobs,
            trackers,
            config,
        }
    }

    /// One backup and retention pass over every source.
    #[instrument(skip_all)]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<Vec<BackupReport>, BackupError> {
        let started = Instant::now();
        let mut reports = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            reports.push(self.backup_source(source.as_ref(), now).await?);
        }
        histogram!("backup_pass_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        Ok(reports)
    }

    async fn backup_source(
        &self,
        source: &dyn BackupSource,
        now: DateTime<Utc>,
    ) -> Result<BackupReport, BackupError> {
        let table = source.name();
        let previous = self.trackers.latest(table).await?;

        let rows = source.snapshot().await?;
        let row_count = rows.len() as i64;
        let backup_name = backup_table_name(table, now);
        let location = format!("backups/{}/{}.json", table, backup_name);
        let bytes = serde_json::to_vec(&rows).map_err(|source| BackupError::Encode {
            source_table: table.to_string(),
            source,
        })?;
        self.blobs.write(&location, bytes).await?;
        self.trackers
            .record(table, &backup_name, row_count, &location, now)
            .await?;
        counter!("backups_taken_total", "source" => table.to_string()).increment(1);

        let previous_row_count = previous.map(|tracker| tracker.row_count);
        match previous_row_count {
            Some(before) => {
                let comparison = match row_count.cmp(&before) {
                    std::cmp::Ordering::Equal => "the same number of",
                    std::cmp::Ordering::Greater => "more",
                    std::cmp::Ordering::Less => "less",
                };
                info!(
                    source = table,
                    backup = %backup_name,
                    rows = row_count,
                    previous_rows = before,
                    "Backup of {} has {} rows than the previous backup ({} vs {})",
                    table,
                    comparison,
                    row_count,
                    before
                );
            }
            None => info!(source = table, backup = %backup_name, rows = row_count, "First backup of {}", table),
        }

        let deleted = self.apply_retention(table, now).await?;
        Ok(BackupReport {
            source_table: table.to_string(),
            backup_name,
            location,
            row_count,
            previous_row_count,
            deleted,
        })
    }

    async fn apply_retention(
        &self,
        table: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, BackupError> {
        let cutoff = now - Duration::days(self.config.delete_after_days);
        let expired = self.trackers.list_older_than(table, cutoff).await?;
        let mut deleted = Vec::with_capacity(expired.len());

        for tracker in expired {
            if !self.blobs.delete(&tracker.location).await? {
                warn!(source = table, location = %tracker.location, "Backup blob already gone");
            }
            self.trackers
                .delete(table, &tracker.backup_table_name)
                .await?;
            info!(source = table, backup = %tracker.backup_table_name, "Deleted expired backup");
            deleted.push(tracker.backup_table_name);
        }
        Ok(deleted)
    }

    /// Runs a pass every `interval_hours` until `shutdown` fires.
    pub async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = StdDuration::from_secs(self.config.interval_hours * 3_600);
        info!(interval_hours = self.config.interval_hours, "Starting backup housekeeping");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Backup housekeeping received shutdown signal, stopping");
                    break;
                }
                _ = sleep(interval) => {
                    if let Err(err) = self.run(Utc::now()).await {
                        error!(error = %err, "Backup pass failed");
                        counter!("backup_failures_total").increment(1);
                    }
                }
            }
        }
    }
}

/// `zzBackup{PascalSource}{yyyyMMddHHmmss}`
pub fn backup_table_name(source_table: &str, at: DateTime<Utc>) -> String {
    let pascal: String = source_table
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect();
    format!("zzBackup{}{}", pascal, at.format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backup_names_sort_by_time() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(backup_table_name("sync_jobs", at), "zzBackupSyncJobs20260304050607");
        let later = backup_table_name("sync_jobs", at + Duration::seconds(1));
        assert!(later > backup_table_name("sync_jobs", at));
    }
}
