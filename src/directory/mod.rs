//! # Directory
//!
//! Contracts for the identity directory: paged group membership reads and
//! membership writes. Transport details live behind these traits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::{AzureAdGroup, AzureAdUser};
use crate::retry::Retryable;

pub mod snapshot;

pub use snapshot::SnapshotDirectory;

/// Errors raised by directory collaborators.
#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    /// Connection resets and throttling; retried with backoff
    #[error("transient directory fault: {0}")]
    Transient(String),
    #[error("group {0} doesn't exist")]
    GroupNotFound(Uuid),
    #[error("directory request failed: {0}")]
    Permanent(String),
}

impl Retryable for DirectoryError {
    fn is_transient(&self) -> bool {
        matches!(self, DirectoryError::Transient(_))
    }
}

/// One page of a group's transitive membership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub users: Vec<AzureAdUser>,
    /// Members that are not users, counted by object type
    #[serde(default)]
    pub non_user_object_counts: BTreeMap<String, u64>,
    /// Present while more pages remain
    pub next_token: Option<String>,
    /// Opaque provider cursor handed back with `next_token`
    #[serde(default)]
    pub cursor: Option<serde_json::Value>,
}

/// Read side of the directory.
#[async_trait]
pub trait DirectoryMembershipProvider: Send + Sync {
    async fn group_exists(&self, group_id: Uuid) -> Result<bool, DirectoryError>;

    async fn get_first_page(&self, group_id: Uuid) -> Result<PageResult, DirectoryError>;

    async fn get_next_page(
        &self,
        next_token: &str,
        cursor: Option<&serde_json::Value>,
    ) -> Result<PageResult, DirectoryError>;
}

/// Write side of the directory.
#[async_trait]
pub trait GroupWriter: Send + Sync {
    async fn add_members(
        &self,
        group: AzureAdGroup,
        users: &[AzureAdUser],
        run_id: Uuid,
    ) -> Result<(), DirectoryError>;

    async fn remove_members(
        &self,
        group: AzureAdGroup,
        users: &[AzureAdUser],
        run_id: Uuid,
    ) -> Result<(), DirectoryError>;
}

/// Stand-in writer for dry runs: logs what would change and touches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunGroupWriter;

#[async_trait]
impl GroupWriter for DryRunGroupWriter {
    async fn add_members(
        &self,
        group: AzureAdGroup,
        users: &[AzureAdUser],
        run_id: Uuid,
    ) -> Result<(), DirectoryError> {
        info!(
            run_id = %run_id,
            group_id = %group.object_id,
            count = users.len(),
            "Dry run: would add users to group"
        );
        Ok(())
    }

    async fn remove_members(
        &self,
        group: AzureAdGroup,
        users: &[AzureAdUser],
        run_id: Uuid,
    ) -> Result<(), DirectoryError> {
        info!(
            run_id = %run_id,
            group_id = %group.object_id,
            count = users.len(),
            "Dry run: would remove users from group"
        );
        Ok(())
    }
}
