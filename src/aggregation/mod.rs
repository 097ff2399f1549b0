//! # Membership Aggregation
//!
//! Destination side of a sync: buffers the parts of a run, merges them once
//! the last one arrives, and applies the resulting delta to the destination
//! group within the job's thresholds.

use thiserror::Error;
use uuid::Uuid;

use crate::directory::DirectoryError;
use crate::notifications::NotificationError;
use crate::repositories::JobStoreError;
use crate::storage::StorageError;

pub mod collector;
pub mod queue;
pub mod receiver;
pub mod updater;

pub use collector::{
    GroupMembershipMessageResponse, MembershipMessage, MergedMembership, SessionMessageCollector,
    merge,
};
pub use queue::{InProcessMessageQueue, MessageQueue, QueueError};
pub use receiver::{MembershipAggregator, PartReceipt};
pub use updater::{GraphUpdater, MembershipUpdater, UpdateOutcome};

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("invalid membership part: {reason}")]
    InvalidPart { reason: String },
    #[error("membership payload unavailable: {0}")]
    Payload(#[from] StorageError),
    #[error("message queue error: {0}")]
    Queue(#[from] QueueError),
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("notification error: {0}")]
    Notification(#[from] NotificationError),
    /// The run's merged membership could not be applied. Repeated for every
    /// later delivery of the run.
    #[error("membership sync of run {run_id} failed: {reason}")]
    SyncFailed { run_id: Uuid, reason: String },
    /// The run's session is being applied right now.
    #[error("membership session of run {run_id} is still being applied")]
    SessionBusy { run_id: Uuid },
}
