//! File-backed directory used for local runs and offline syncs.
//!
//! Each group is one JSON document at `directory/groups/{group_id}.json`.
//! Reads are paged with tokens of the form `{group_id}:{offset}` and writes
//! rewrite the whole document.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{DirectoryError, DirectoryMembershipProvider, GroupWriter, PageResult};
use crate::models::{AzureAdGroup, AzureAdUser};
use crate::storage::{BlobStore, StorageError};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Stored shape of one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub members: Vec<AzureAdUser>,
    #[serde(default)]
    pub non_user_object_counts: BTreeMap<String, u64>,
}

/// Directory reading and writing group snapshots in a [`BlobStore`].
pub struct SnapshotDirectory {
    blobs: Arc<dyn BlobStore>,
    page_size: usize,
    write_lock: Mutex<()>,
}

impl SnapshotDirectory {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            page_size: DEFAULT_PAGE_SIZE,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn group_path(group_id: Uuid) -> String {
        format!("directory/groups/{}.json", group_id)
    }

    /// Creates or replaces a group document.
    pub async fn put_group(
        &self,
        group_id: Uuid,
        snapshot: &GroupSnapshot,
    ) -> Result<(), DirectoryError> {
        let bytes = serde_json::to_vec(snapshot)
            .map_err(|err| DirectoryError::Permanent(err.to_string()))?;
        self.blobs
            .write(&Self::group_path(group_id), bytes)
            .await
            .map_err(storage_fault)
    }

    async fn load(&self, group_id: Uuid) -> Result<Option<GroupSnapshot>, DirectoryError> {
        match self.blobs.read(&Self::group_path(group_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| DirectoryError::Permanent(err.to_string())),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(err) => Err(storage_fault(err)),
        }
    }

    async fn page(&self, group_id: Uuid, offset: usize) -> Result<PageResult, DirectoryError> {
        let snapshot = self
            .load(group_id)
            .await?
            .ok_or(DirectoryError::GroupNotFound(group_id))?;

        let end = (offset + self.page_size).min(snapshot.members.len());
        let users = snapshot.members.get(offset..end).unwrap_or_default().to_vec();
        let next_token = (end < snapshot.members.len()).then(|| format!("{}:{}", group_id, end));

        // Non-user objects are reported once, on the first page
        let non_user_object_counts = if offset == 0 {
            snapshot.non_user_object_counts
        } else {
            BTreeMap::new()
        };

        Ok(PageResult {
            users,
            non_user_object_counts,
            next_token,
            cursor: None,
        })
    }

    async fn modify<F>(&self, group: AzureAdGroup, change: F) -> Result<(), DirectoryError>
    where
        F: FnOnce(&mut GroupSnapshot),
    {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self
            .load(group.object_id)
            .await?
            .ok_or(DirectoryError::GroupNotFound(group.object_id))?;
        change(&mut snapshot);
        self.put_group(group.object_id, &snapshot).await
    }
}

fn storage_fault(err: StorageError) -> DirectoryError {
    match err {
        StorageError::Io { .. } => DirectoryError::Transient(err.to_string()),
        other => DirectoryError::Permanent(other.to_string()),
    }
}

fn parse_token(token: &str) -> Result<(Uuid, usize), DirectoryError> {
    let invalid = || DirectoryError::Permanent(format!("malformed page token '{}'", token));
    let (group, offset) = token.split_once(':').ok_or_else(invalid)?;
    let group = Uuid::parse_str(group).map_err(|_| invalid())?;
    let offset = offset.parse().map_err(|_| invalid())?;
    Ok((group, offset))
}

#[async_trait]
impl DirectoryMembershipProvider for SnapshotDirectory {
    async fn group_exists(&self, group_id: Uuid) -> Result<bool, DirectoryError> {
        Ok(self.load(group_id).await?.is_some())
    }

    async fn get_first_page(&self, group_id: Uuid) -> Result<PageResult, DirectoryError> {
        self.page(group_id, 0).await
    }

    async fn get_next_page(
        &self,
        next_token: &str,
        _cursor: Option<&serde_json::Value>,
    ) -> Result<PageResult, DirectoryError> {
        let (group_id, offset) = parse_token(next_token)?;
        self.page(group_id, offset).await
    }
}

#[async_trait]
impl GroupWriter for SnapshotDirectory {
    async fn add_members(
        &self,
        group: AzureAdGroup,
        users: &[AzureAdUser],
        run_id: Uuid,
    ) -> Result<(), DirectoryError> {
        self.modify(group, |snapshot| {
            let existing: BTreeSet<AzureAdUser> = snapshot.members.iter().copied().collect();
            snapshot
                .members
                .extend(users.iter().filter(|user| !existing.contains(user)).copied());
        })
        .await?;
        debug!(run_id = %run_id, group_id = %group.object_id, count = users.len(), "Added members");
        Ok(())
    }

    async fn remove_members(
        &self,
        group: AzureAdGroup,
        users: &[AzureAdUser],
        run_id: Uuid,
    ) -> Result<(), DirectoryError> {
        let removed: BTreeSet<AzureAdUser> = users.iter().copied().collect();
        self.modify(group, |snapshot| {
            snapshot.members.retain(|user| !removed.contains(user));
        })
        .await?;
        debug!(run_id = %run_id, group_id = %group.object_id, count = users.len(), "Removed members");
        Ok(())
    }
}
