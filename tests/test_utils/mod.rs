//! Test utilities for database and collaborator testing.
//!
//! This module provides an in-memory SQLite database with migrations applied,
//! sync job fixtures, and recording doubles for the service's collaborators.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use groupsync::directory::{
    DirectoryError, DirectoryMembershipProvider, GroupWriter, PageResult, SnapshotDirectory,
};
use groupsync::aggregation::{GraphUpdater, InProcessMessageQueue, MembershipAggregator};
use groupsync::directory::snapshot::GroupSnapshot;
use groupsync::models::sync_job::{ActiveModel, Model};
use groupsync::models::{AzureAdGroup, AzureAdUser, GroupMembership, JobKey};
use groupsync::notifications::{NotificationError, NotificationSender};
use groupsync::orchestration::{
    AggregatorClient, AggregatorError, MembershipAggregatorRequest, OrchestrationContext,
    SyncOrchestrationWorkflow,
};
use groupsync::repositories::{
    CheckpointRepository, CheckpointStore, JobStore, SyncJobRepository,
};
use groupsync::retry::RetryPolicy;
use groupsync::storage::{BlobPayloadStore, BlobStore, MembershipPayloadStore, StorageError};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, IntoActiveModel};
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Sets up an in-memory SQLite database with all migrations applied and returns an Arc.
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

/// An enabled, idle, never-run job syncing `query` into `target`.
pub fn sync_job(query: &str, target: Uuid) -> Model {
    let created = Utc::now() - chrono::Duration::days(1);
    Model {
        partition_key: created.format("%Y-%m-%d").to_string(),
        row_key: Uuid::new_v4().to_string(),
        target_office_group_id: target,
        query: query.to_string(),
        period: 24,
        start_date: created.fixed_offset(),
        last_run_time: None,
        dry_run_time_stamp: None,
        enabled: true,
        is_dry_run_enabled: false,
        status: "Idle".to_string(),
        threshold_percentage_for_additions: 100,
        threshold_percentage_for_removals: 20,
        threshold_violations: 0,
        requestor: "owner@example.com".to_string(),
        run_id: None,
        version: 0,
        created_at: created.fixed_offset(),
        updated_at: created.fixed_offset(),
    }
}

/// Inserts `job` and returns the stored row.
pub async fn insert_sync_job(db: &DatabaseConnection, job: Model) -> Result<Model> {
    let active: ActiveModel = job.into_active_model();
    Ok(active.reset_all().insert(db).await?)
}

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|err| panic!("bad timestamp {rfc3339}: {err}"))
}

pub fn users(n: usize) -> Vec<AzureAdUser> {
    let mut users: Vec<AzureAdUser> = (0..n).map(|_| AzureAdUser::new(Uuid::new_v4())).collect();
    users.sort();
    users
}

/// Blob store kept in a map.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn paths(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    pub fn paths_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.paths()
            .into_iter()
            .filter(|path| path.starts_with(prefix))
            .collect()
    }

    pub fn get_json(&self, path: &str) -> Option<serde_json::Value> {
        self.blobs
            .lock()
            .unwrap()
            .get(path)
            .map(|bytes| serde_json::from_slice(bytes).unwrap())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.blobs.lock().unwrap().insert(path.to_string(), bytes);
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
            })
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.lock().unwrap().remove(path).is_some())
    }
}

/// Snapshot directory over an in-memory store that counts read calls.
pub struct CountingDirectory {
    pub inner: SnapshotDirectory,
    calls: AtomicUsize,
}

impl CountingDirectory {
    pub fn new(blobs: Arc<InMemoryBlobStore>) -> Self {
        Self {
            inner: SnapshotDirectory::new(blobs).with_page_size(2),
            calls: AtomicUsize::new(0),
        }
    }

    pub async fn put_group(&self, group_id: Uuid, members: &[AzureAdUser]) {
        self.inner
            .put_group(
                group_id,
                &GroupSnapshot {
                    members: members.to_vec(),
                    non_user_object_counts: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
    }

    pub async fn members(&self, group_id: Uuid) -> Vec<AzureAdUser> {
        let mut page = self.inner.get_first_page(group_id).await.unwrap();
        let mut members = std::mem::take(&mut page.users);
        while let Some(token) = page.next_token.take() {
            page = self.inner.get_next_page(&token, None).await.unwrap();
            members.append(&mut page.users);
        }
        members.sort();
        members
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryMembershipProvider for CountingDirectory {
    async fn group_exists(&self, group_id: Uuid) -> Result<bool, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.group_exists(group_id).await
    }

    async fn get_first_page(&self, group_id: Uuid) -> Result<PageResult, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_first_page(group_id).await
    }

    async fn get_next_page(
        &self,
        next_token: &str,
        cursor: Option<&serde_json::Value>,
    ) -> Result<PageResult, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_next_page(next_token, cursor).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupWrite {
    Add(Uuid, Vec<AzureAdUser>),
    Remove(Uuid, Vec<AzureAdUser>),
}

/// Records writes and forwards them to a snapshot directory.
pub struct RecordingGroupWriter {
    directory: Arc<CountingDirectory>,
    writes: Mutex<Vec<GroupWrite>>,
}

impl RecordingGroupWriter {
    pub fn new(directory: Arc<CountingDirectory>) -> Self {
        Self {
            directory,
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn writes(&self) -> Vec<GroupWrite> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl GroupWriter for RecordingGroupWriter {
    async fn add_members(
        &self,
        group: AzureAdGroup,
        users: &[AzureAdUser],
        run_id: Uuid,
    ) -> Result<(), DirectoryError> {
        self.writes
            .lock()
            .unwrap()
            .push(GroupWrite::Add(group.object_id, users.to_vec()));
        self.directory.inner.add_members(group, users, run_id).await
    }

    async fn remove_members(
        &self,
        group: AzureAdGroup,
        users: &[AzureAdUser],
        run_id: Uuid,
    ) -> Result<(), DirectoryError> {
        self.writes
            .lock()
            .unwrap()
            .push(GroupWrite::Remove(group.object_id, users.to_vec()));
        self.directory.inner.remove_members(group, users, run_id).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentEmail {
    pub template_id: String,
    pub recipient: String,
    pub params: BTreeMap<String, String>,
    pub run_id: Uuid,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentEmail>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send(
        &self,
        template_id: &str,
        recipient: &str,
        _cc: &[String],
        params: &BTreeMap<String, String>,
        run_id: Uuid,
    ) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(SentEmail {
            template_id: template_id.to_string(),
            recipient: recipient.to_string(),
            params: params.clone(),
            run_id,
        });
        Ok(())
    }
}

/// Aggregator double that records requests and can be told to fail.
#[derive(Default)]
pub struct RecordingAggregatorClient {
    requests: Mutex<Vec<MembershipAggregatorRequest>>,
    failures: Mutex<HashMap<u32, String>>,
}

impl RecordingAggregatorClient {
    pub fn fail_part(&self, part: u32, reason: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(part, reason.to_string());
    }

    pub fn requests(&self) -> Vec<MembershipAggregatorRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AggregatorClient for RecordingAggregatorClient {
    async fn submit(
        &self,
        request: &MembershipAggregatorRequest,
        _run_id: Uuid,
    ) -> Result<(), AggregatorError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.failures.lock().unwrap().get(&request.part_number) {
            Some(reason) => Err(AggregatorError::UnexpectedStatus {
                status: 500,
                body: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Every collaborator of the sync pipeline, backed by an in-memory database
/// and blob store.
pub struct Harness {
    pub db: Arc<DatabaseConnection>,
    pub jobs: Arc<dyn JobStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub payloads: Arc<dyn MembershipPayloadStore>,
    pub directory: Arc<CountingDirectory>,
    pub writer: Arc<RecordingGroupWriter>,
    pub notifier: Arc<RecordingNotifier>,
    pub queue: Arc<InProcessMessageQueue>,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        let db = setup_test_db_arc().await?;
        let blobs = Arc::new(InMemoryBlobStore::default());
        let directory = Arc::new(CountingDirectory::new(Arc::clone(&blobs)));
        let writer = Arc::new(RecordingGroupWriter::new(Arc::clone(&directory)));
        let payload_blobs: Arc<dyn BlobStore> = blobs.clone();

        Ok(Self {
            jobs: Arc::new(SyncJobRepository::new(Arc::clone(&db))),
            checkpoints: Arc::new(CheckpointRepository::new(Arc::clone(&db))),
            payloads: Arc::new(BlobPayloadStore::new(payload_blobs)),
            db,
            blobs,
            directory,
            writer,
            notifier: Arc::new(RecordingNotifier::default()),
            queue: Arc::new(InProcessMessageQueue::new()),
        })
    }

    pub fn retry() -> RetryPolicy {
        RetryPolicy::immediate(2)
    }

    pub fn updater(&self, dry_run: bool) -> Arc<GraphUpdater> {
        Arc::new(GraphUpdater::new(
            Arc::clone(&self.jobs),
            self.directory.clone(),
            self.writer.clone(),
            self.notifier.clone(),
            Self::retry(),
            dry_run,
        ))
    }

    pub fn aggregator(&self, session_timeout: chrono::Duration) -> Arc<MembershipAggregator> {
        Arc::new(MembershipAggregator::new(
            Arc::clone(&self.payloads),
            self.queue.clone(),
            self.updater(false),
            session_timeout,
        ))
    }

    pub fn workflow(&self, aggregator: Arc<dyn AggregatorClient>) -> Arc<SyncOrchestrationWorkflow> {
        Arc::new(SyncOrchestrationWorkflow::new(OrchestrationContext {
            jobs: Arc::clone(&self.jobs),
            checkpoints: Arc::clone(&self.checkpoints),
            directory: self.directory.clone(),
            payloads: Arc::clone(&self.payloads),
            notifier: self.notifier.clone(),
            aggregator,
            retry: Self::retry(),
            dry_run: false,
        }))
    }

    pub async fn insert_job(&self, job: Model) -> Result<Model> {
        insert_sync_job(&self.db, job).await
    }

    pub async fn job(&self, key: &JobKey) -> Model {
        self.jobs.get_job(key).await.unwrap().unwrap()
    }

    /// Stores one part's payload and returns the request that announces it.
    pub async fn stage_part(
        &self,
        job: &Model,
        run_id: Uuid,
        part: u32,
        parts: u32,
        members: &[AzureAdUser],
    ) -> MembershipAggregatorRequest {
        let body = GroupMembership {
            destination: AzureAdGroup::new(job.target_office_group_id),
            source_members: members.to_vec(),
            run_id,
            sync_job_partition_key: job.partition_key.clone(),
            sync_job_row_key: job.row_key.clone(),
            membership_obtainer_dry_run_enabled: false,
            part_number: part,
            parts_count: parts,
            is_last_message: false,
            is_destination_part: false,
        };
        let path = format!("/{}/{}_{}.json", job.target_office_group_id, run_id, part);
        let file_path = self.payloads.write(&path, &body).await.unwrap();
        MembershipAggregatorRequest {
            file_path,
            part_number: part,
            parts_count: parts,
            partition_key: job.partition_key.clone(),
            row_key: job.row_key.clone(),
            is_destination_part: false,
        }
    }
}
