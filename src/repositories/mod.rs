//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the sync
//! job, orchestration checkpoint and backup tracker tables.

pub mod backup_tracker;
pub mod checkpoint;
pub mod sync_job;

pub use backup_tracker::BackupTrackerRepository;
pub use checkpoint::{CheckpointError, CheckpointRepository, CheckpointStore};
pub use sync_job::{JobStatusUpdate, JobStore, JobStoreError, SyncJobRepository, WriteSummary};
