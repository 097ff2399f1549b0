//! Blob storage for membership payloads, directory snapshots, outgoing
//! notifications and backups.
//!
//! Paths are `/`-separated and relative to the store root. A leading `/` is
//! accepted and ignored, so `/group/file.json` and `group/file.json` name the
//! same blob.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::models::GroupMembership;

/// Errors raised by blob and payload stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob '{path}' not found")]
    NotFound { path: String },
    #[error("invalid blob path '{path}'")]
    InvalidPath { path: String },
    #[error("blob io error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("blob '{path}' is not valid json: {source}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Minimal blob store contract.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Creates or replaces the blob at `path`.
    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Returns false when there was nothing to delete.
    async fn delete(&self, path: &str) -> Result<bool, StorageError>;
}

/// [`BlobStore`] backed by a local directory tree.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let safe = !relative.as_os_str().is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(path: &str, source: std::io::Error) -> StorageError {
    if source.kind() == ErrorKind::NotFound {
        StorageError::NotFound {
            path: path.to_string(),
        }
    } else {
        StorageError::Io {
            path: path.to_string(),
            source,
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(path, source))?;
        }

        // Write then rename so readers never observe a partial blob
        let staging = target.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&staging, bytes)
            .await
            .map_err(|source| io_error(path, source))?;
        fs::rename(&staging, &target)
            .await
            .map_err(|source| io_error(path, source))?;

        debug!(path, "Blob written");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        fs::read(&target)
            .await
            .map_err(|source| io_error(path, source))
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error(path, source)),
        }
    }
}

/// Reads and writes serialized [`GroupMembership`] payloads.
#[async_trait]
pub trait MembershipPayloadStore: Send + Sync {
    /// Stores `payload` at `path` and returns the handle to read it back.
    async fn write(&self, path: &str, payload: &GroupMembership) -> Result<String, StorageError>;

    async fn read(&self, handle: &str) -> Result<GroupMembership, StorageError>;
}

/// [`MembershipPayloadStore`] that stores JSON documents in a [`BlobStore`].
#[derive(Clone)]
pub struct BlobPayloadStore {
    blobs: Arc<dyn BlobStore>,
}

impl BlobPayloadStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }
}

#[async_trait]
impl MembershipPayloadStore for BlobPayloadStore {
    async fn write(&self, path: &str, payload: &GroupMembership) -> Result<String, StorageError> {
        let bytes = serde_json::to_vec(payload).map_err(|source| StorageError::Serialization {
            path: path.to_string(),
            source,
        })?;
        self.blobs.write(path, bytes).await?;
        Ok(path.to_string())
    }

    async fn read(&self, handle: &str) -> Result<GroupMembership, StorageError> {
        let bytes = self.blobs.read(handle).await?;
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Serialization {
            path: handle.to_string(),
            source,
        })
    }
}

/// `/{target}/{MMddyyyy-HHmmss}_{run_id}_SecurityGroup_{part}.json`
pub fn membership_payload_path(
    target_group: Uuid,
    run_id: Uuid,
    part: u32,
    at: DateTime<Utc>,
) -> String {
    format!(
        "/{}/{}_{}_SecurityGroup_{}.json",
        target_group,
        at.format("%m%d%Y-%H%M%S"),
        run_id,
        part
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AzureAdGroup, AzureAdUser};
    use chrono::TimeZone;

    fn membership() -> GroupMembership {
        GroupMembership {
            destination: AzureAdGroup::new(Uuid::new_v4()),
            source_members: vec![AzureAdUser::new(Uuid::new_v4())],
            run_id: Uuid::new_v4(),
            sync_job_partition_key: "2025-01-01".to_string(),
            sync_job_row_key: "job".to_string(),
            membership_obtainer_dry_run_enabled: false,
            part_number: 1,
            parts_count: 1,
            is_last_message: false,
            is_destination_part: false,
        }
    }

    #[test]
    fn payload_path_uses_target_timestamp_run_and_part() {
        let target = Uuid::parse_str("3f2504e0-4f89-11d3-9a0c-0305e82c3301").unwrap();
        let run_id = Uuid::parse_str("c56a4180-65aa-42ec-a945-5fd21dec0538").unwrap();
        let at = Utc.with_ymd_and_hms(2025, 3, 7, 14, 5, 9).unwrap();

        assert_eq!(
            membership_payload_path(target, run_id, 2, at),
            "/3f2504e0-4f89-11d3-9a0c-0305e82c3301/03072025-140509_c56a4180-65aa-42ec-a945-5fd21dec0538_SecurityGroup_2.json"
        );
    }

    #[tokio::test]
    async fn payloads_survive_a_filesystem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobPayloadStore::new(Arc::new(FsBlobStore::new(dir.path())));
        let payload = membership();

        let handle = store.write("/group/part_1.json", &payload).await.unwrap();
        assert_eq!(store.read(&handle).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn rejects_paths_escaping_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let err = store.write("../outside.json", vec![]).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn missing_blobs_report_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        assert!(matches!(
            store.read("nope.json").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(!store.delete("nope.json").await.unwrap());
    }
}
