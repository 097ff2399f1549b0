//! Sync job status values as stored in the `status` column.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Lifecycle status of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum SyncStatus {
    Idle,
    InProgress,
    Error,
    SecurityGroupNotFound,
    ThresholdExceeded,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "Idle",
            SyncStatus::InProgress => "InProgress",
            SyncStatus::Error => "Error",
            SyncStatus::SecurityGroupNotFound => "SecurityGroupNotFound",
            SyncStatus::ThresholdExceeded => "ThresholdExceeded",
        }
    }

    /// An errored job is disabled until someone re-enables it.
    pub fn disables_job(&self) -> bool {
        matches!(self, SyncStatus::Error)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown sync status '{0}'")]
pub struct UnknownSyncStatus(pub String);

impl FromStr for SyncStatus {
    type Err = UnknownSyncStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Idle" => Ok(SyncStatus::Idle),
            "InProgress" => Ok(SyncStatus::InProgress),
            "Error" => Ok(SyncStatus::Error),
            "SecurityGroupNotFound" => Ok(SyncStatus::SecurityGroupNotFound),
            "ThresholdExceeded" => Ok(SyncStatus::ThresholdExceeded),
            other => Err(UnknownSyncStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_stored_value() {
        for status in [
            SyncStatus::Idle,
            SyncStatus::InProgress,
            SyncStatus::Error,
            SyncStatus::SecurityGroupNotFound,
            SyncStatus::ThresholdExceeded,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("queued".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn only_errors_disable_jobs() {
        assert!(SyncStatus::Error.disables_job());
        assert!(!SyncStatus::SecurityGroupNotFound.disables_job());
        assert!(!SyncStatus::Idle.disables_job());
        assert!(!SyncStatus::ThresholdExceeded.disables_job());
    }
}
