//! Integration tests for the sync orchestration workflow and launcher

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use groupsync::directory::{DirectoryError, DirectoryMembershipProvider, PageResult};
use groupsync::models::SyncStatus;
use groupsync::models::sync_job::Model;
use groupsync::notifications::SYNC_DISABLED_NO_VALID_GROUP_IDS;
use groupsync::orchestration::{
    Command, LaunchOutcome, LocalAggregatorClient, OrchestrationContext, OrchestrationError,
    OrchestrationLauncher, OrchestrationRequest, OrchestrationState, Phase, RecoveryOutcome,
    SyncOrchestrationWorkflow,
};
use groupsync::repositories::JobStatusUpdate;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::{Harness, RecordingAggregatorClient, sync_job, users};

/// Directory that never recovers from a transient fault.
#[derive(Default)]
struct FlakyDirectory {
    calls: AtomicUsize,
}

impl FlakyDirectory {
    fn fault(&self) -> DirectoryError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        DirectoryError::Transient("connection reset".to_string())
    }
}

#[async_trait]
impl DirectoryMembershipProvider for FlakyDirectory {
    async fn group_exists(&self, _group_id: Uuid) -> Result<bool, DirectoryError> {
        Err(self.fault())
    }

    async fn get_first_page(&self, _group_id: Uuid) -> Result<PageResult, DirectoryError> {
        Err(self.fault())
    }

    async fn get_next_page(
        &self,
        _next_token: &str,
        _cursor: Option<&serde_json::Value>,
    ) -> Result<PageResult, DirectoryError> {
        Err(self.fault())
    }
}

/// Claims `job` for `run_id` the way the launcher does.
async fn claim(harness: &Harness, job: &Model, run_id: Uuid) -> Result<Model> {
    Ok(harness
        .jobs
        .update_job(
            job,
            JobStatusUpdate::new(SyncStatus::InProgress).with_run_id(run_id),
        )
        .await?)
}

/// Checkpoint of an instance that stopped right after it was created.
fn interrupted(job: &Model, run_id: Uuid, part: u32, total: u32) -> OrchestrationState {
    OrchestrationState {
        instance_id: OrchestrationState::instance_id(run_id, part),
        run_id,
        job: job.key(),
        current_part: part,
        total_parts: total,
        is_destination_part: false,
        phase: Phase::Validating,
        target_group_id: job.target_office_group_id,
        requestor: job.requestor.clone(),
        dry_run: false,
        part_query: Some(job.query.clone()),
        source_groups: Vec::new(),
        collections: Vec::new(),
        members: Vec::new(),
        payload_path: None,
        final_status: None,
        started_at: Utc::now(),
        finished_at: None,
        commands: Vec::new(),
    }
}

fn request(job: &Model, part: u32, total: u32) -> OrchestrationRequest {
    OrchestrationRequest {
        job: job.key(),
        run_id: Some(Uuid::new_v4()),
        current_part: part,
        total_parts: total,
        is_destination_part: false,
    }
}

#[tokio::test]
async fn zero_part_errors_without_touching_the_directory() -> Result<()> {
    let harness = Harness::new().await?;
    let job = harness
        .insert_job(sync_job(&Uuid::new_v4().to_string(), Uuid::new_v4()))
        .await?;
    let aggregator = Arc::new(RecordingAggregatorClient::default());
    let workflow = harness.workflow(aggregator.clone());

    let outcome = workflow.run(request(&job, 0, 1)).await?;

    assert_eq!(outcome.phase, Phase::Error);
    assert_eq!(outcome.status, Some(SyncStatus::Error));
    assert_eq!(harness.directory.calls(), 0);
    assert!(aggregator.requests().is_empty());

    let stored = harness.job(&job.key()).await;
    assert_eq!(stored.sync_status()?, SyncStatus::Error);
    assert!(!stored.enabled);
    Ok(())
}

#[tokio::test]
async fn invalid_query_emails_the_requestor_once() -> Result<()> {
    let harness = Harness::new().await?;
    let job = harness
        .insert_job(sync_job("not-a-group-id", Uuid::new_v4()))
        .await?;
    let workflow = harness.workflow(Arc::new(RecordingAggregatorClient::default()));

    let outcome = workflow.run(request(&job, 1, 1)).await?;

    assert_eq!(outcome.phase, Phase::Error);
    assert_eq!(harness.directory.calls(), 0);

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template_id, SYNC_DISABLED_NO_VALID_GROUP_IDS);
    assert_eq!(sent[0].recipient, job.requestor);
    assert_eq!(
        sent[0].params.get("destinationGroupId"),
        Some(&job.target_office_group_id.to_string())
    );

    let stored = harness.job(&job.key()).await;
    assert_eq!(stored.sync_status()?, SyncStatus::Error);
    assert!(!stored.enabled);
    Ok(())
}

#[tokio::test]
async fn missing_source_group_marks_the_job() -> Result<()> {
    let harness = Harness::new().await?;
    let missing = Uuid::new_v4();
    let job = harness
        .insert_job(sync_job(&missing.to_string(), Uuid::new_v4()))
        .await?;
    let aggregator = Arc::new(RecordingAggregatorClient::default());
    let workflow = harness.workflow(aggregator.clone());

    let outcome = workflow.run(request(&job, 1, 1)).await?;

    assert_eq!(outcome.phase, Phase::Error);
    assert_eq!(outcome.status, Some(SyncStatus::SecurityGroupNotFound));
    assert!(aggregator.requests().is_empty());

    let stored = harness.job(&job.key()).await;
    assert_eq!(stored.sync_status()?, SyncStatus::SecurityGroupNotFound);
    assert!(stored.enabled);
    Ok(())
}

#[tokio::test]
async fn collected_members_are_persisted_and_handed_off() -> Result<()> {
    let harness = Harness::new().await?;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let a = users(3);
    let mut b = users(2);
    b.push(a[0]);
    harness.directory.put_group(first, &a).await;
    harness.directory.put_group(second, &b).await;

    let job = harness
        .insert_job(sync_job(&format!("{};{}", first, second), Uuid::new_v4()))
        .await?;
    let aggregator = Arc::new(RecordingAggregatorClient::default());
    let workflow = harness.workflow(aggregator.clone());

    let outcome = workflow.run(request(&job, 1, 1)).await?;

    assert_eq!(outcome.phase, Phase::Completed);
    assert_eq!(outcome.status, None);
    let path = outcome.payload_path.clone().expect("payload written");

    let requests = aggregator.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].file_path, path);
    assert_eq!(requests[0].part_number, 1);
    assert_eq!(requests[0].parts_count, 1);
    assert_eq!(requests[0].row_key, job.row_key);

    let payload = harness.payloads.read(&path).await?;
    assert_eq!(payload.run_id, outcome.run_id);
    assert_eq!(payload.destination.object_id, job.target_office_group_id);
    // first occurrence wins, duplicates dropped
    assert_eq!(payload.source_members.len(), 5);
    assert_eq!(&payload.source_members[..3], &a[..]);
    assert!(path.contains(&format!("_{}_SecurityGroup_1.json", outcome.run_id)));

    // Success leaves the job status to the aggregation stage
    let stored = harness.job(&job.key()).await;
    assert_eq!(stored.sync_status()?, SyncStatus::Idle);
    Ok(())
}

#[tokio::test]
async fn rerunning_a_finished_instance_emits_nothing_again() -> Result<()> {
    let harness = Harness::new().await?;
    let job = harness.insert_job(sync_job("bogus", Uuid::new_v4())).await?;
    let workflow = harness.workflow(Arc::new(RecordingAggregatorClient::default()));
    let first = request(&job, 1, 1);

    workflow.run(first.clone()).await?;
    assert_eq!(harness.notifier.sent().len(), 1);

    let outcome = workflow.run(first).await?;
    assert_eq!(outcome.phase, Phase::Error);
    assert_eq!(harness.notifier.sent().len(), 1);
    Ok(())
}

#[tokio::test]
async fn resume_replays_only_undispatched_commands() -> Result<()> {
    let harness = Harness::new().await?;
    let job = harness.insert_job(sync_job("bogus", Uuid::new_v4())).await?;
    let workflow = harness.workflow(Arc::new(RecordingAggregatorClient::default()));
    let req = request(&job, 1, 1);
    let run_id = req.run_id.unwrap();

    workflow.run(req.clone()).await?;

    // Simulate a crash after the email went out but before the status write
    let instance_id = OrchestrationState::instance_id(run_id, 1);
    let mut state = harness.checkpoints.load(&instance_id).await?.unwrap();
    let status_entry = state
        .commands
        .iter_mut()
        .find(|entry| matches!(entry.command, Command::UpdateJobStatus { .. }))
        .unwrap();
    status_entry.dispatched = false;
    harness.checkpoints.save(&state).await?;

    // Someone re-enables the job in the meantime
    let stored = harness.job(&job.key()).await;
    let mut active: groupsync::models::sync_job::ActiveModel = stored.into();
    active.enabled = sea_orm::Set(true);
    active.status = sea_orm::Set(SyncStatus::Idle.to_string());
    sea_orm::ActiveModelTrait::update(active, harness.db.as_ref()).await?;

    let outcome = workflow.run(req).await?;

    assert_eq!(outcome.phase, Phase::Error);
    assert_eq!(harness.notifier.sent().len(), 1);
    let stored = harness.job(&job.key()).await;
    assert_eq!(stored.sync_status()?, SyncStatus::Error);
    assert!(!stored.enabled);

    let state = harness.checkpoints.load(&instance_id).await?.unwrap();
    assert!(state.pending_commands().is_empty());
    Ok(())
}

#[tokio::test]
async fn aggregator_failure_errors_the_job() -> Result<()> {
    let harness = Harness::new().await?;
    let source = Uuid::new_v4();
    harness.directory.put_group(source, &users(2)).await;
    let job = harness
        .insert_job(sync_job(&source.to_string(), Uuid::new_v4()))
        .await?;
    let aggregator = Arc::new(RecordingAggregatorClient::default());
    aggregator.fail_part(1, "aggregator unavailable");
    let workflow = harness.workflow(aggregator.clone());

    let outcome = workflow.run(request(&job, 1, 1)).await?;

    assert_eq!(outcome.phase, Phase::Error);
    assert_eq!(outcome.status, Some(SyncStatus::Error));
    assert_eq!(aggregator.requests().len(), 1);
    assert_eq!(harness.job(&job.key()).await.sync_status()?, SyncStatus::Error);
    Ok(())
}

#[tokio::test]
async fn status_writes_skip_jobs_owned_by_another_run() -> Result<()> {
    let harness = Harness::new().await?;
    let owner = Uuid::new_v4();
    let mut job = sync_job(&Uuid::new_v4().to_string(), Uuid::new_v4());
    job.run_id = Some(owner);
    job.status = SyncStatus::InProgress.to_string();
    let job = harness.insert_job(job).await?;
    let workflow = harness.workflow(Arc::new(RecordingAggregatorClient::default()));

    // part 0 fails validation under a different run id
    let outcome = workflow.run(request(&job, 0, 1)).await?;
    assert_eq!(outcome.phase, Phase::Error);

    let stored = harness.job(&job.key()).await;
    assert_eq!(stored.sync_status()?, SyncStatus::InProgress);
    assert_eq!(stored.run_id, Some(owner));
    Ok(())
}

#[tokio::test]
async fn unknown_job_is_reported() -> Result<()> {
    let harness = Harness::new().await?;
    let workflow = harness.workflow(Arc::new(RecordingAggregatorClient::default()));
    let ghost = sync_job("bogus", Uuid::new_v4());

    let err = workflow.run(request(&ghost, 1, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        groupsync::orchestration::OrchestrationError::JobNotFound { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn launcher_drives_every_part_through_aggregation() -> Result<()> {
    let harness = Harness::new().await?;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let target = Uuid::new_v4();
    let pool = users(4);
    let stale = pool[3];
    harness.directory.put_group(first, &pool[..2]).await;
    harness.directory.put_group(second, &pool[1..3]).await;
    harness.directory.put_group(target, &[pool[0], stale]).await;

    let query = format!(
        r#"[{{"type":"SecurityGroup","source":"{}"}},{{"type":"SecurityGroup","source":"{}"}}]"#,
        first, second
    );
    let mut job = sync_job(&query, target);
    job.threshold_percentage_for_additions = 100;
    job.threshold_percentage_for_removals = 50;
    let job = harness.insert_job(job).await?;

    let aggregator = harness.aggregator(Duration::hours(1));
    let workflow = harness.workflow(Arc::new(LocalAggregatorClient::new(Arc::clone(&aggregator))));
    let launcher = OrchestrationLauncher::new(Arc::clone(&harness.jobs), workflow, 2, false);

    let LaunchOutcome::Launched {
        run_id,
        total_parts,
        handle,
    } = launcher.launch(&job).await?
    else {
        panic!("job should launch");
    };
    assert_eq!(total_parts, 2);

    let results = handle.await?;
    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.as_ref().unwrap().phase, Phase::Completed);
    }
    assert_eq!(launcher.in_flight_count(), 0);

    let stored = harness.job(&job.key()).await;
    assert_eq!(stored.sync_status()?, SyncStatus::Idle);
    assert_eq!(stored.run_id, Some(run_id));
    assert!(stored.last_run_time.is_some());
    assert_eq!(stored.threshold_violations, 0);

    let expected: Vec<_> = pool[..3].to_vec();
    assert_eq!(harness.directory.members(target).await, expected);
    assert_eq!(harness.queue.completed_count(), 2);
    assert_eq!(aggregator.open_sessions(), 0);
    Ok(())
}

#[tokio::test]
async fn destination_part_supplies_current_members() -> Result<()> {
    let harness = Harness::new().await?;
    let source = Uuid::new_v4();
    let target = Uuid::new_v4();
    let pool = users(3);
    harness.directory.put_group(source, &pool).await;
    harness.directory.put_group(target, &pool[..2]).await;

    let job = harness
        .insert_job(sync_job(&source.to_string(), target))
        .await?;
    let aggregator = harness.aggregator(Duration::hours(1));
    let workflow = harness.workflow(Arc::new(LocalAggregatorClient::new(aggregator)));
    let launcher = OrchestrationLauncher::new(Arc::clone(&harness.jobs), workflow, 1, true);

    let LaunchOutcome::Launched {
        total_parts,
        handle,
        ..
    } = launcher.launch(&job).await?
    else {
        panic!("job should launch");
    };
    assert_eq!(total_parts, 2);
    let results = handle.await?;
    assert!(results.iter().all(|result| result.is_ok()));

    assert_eq!(harness.directory.members(target).await, pool);
    assert_eq!(harness.job(&job.key()).await.sync_status()?, SyncStatus::Idle);
    Ok(())
}

#[tokio::test]
async fn launching_a_claimed_job_is_refused() -> Result<()> {
    let harness = Harness::new().await?;
    let job = harness
        .insert_job(sync_job(&Uuid::new_v4().to_string(), Uuid::new_v4()))
        .await?;
    let workflow = harness.workflow(Arc::new(RecordingAggregatorClient::default()));
    let launcher = OrchestrationLauncher::new(Arc::clone(&harness.jobs), workflow, 1, false);

    // Another scheduler claimed the row after `job` was read
    harness
        .jobs
        .update_job(
            &job,
            groupsync::repositories::JobStatusUpdate::new(SyncStatus::Idle),
        )
        .await?;

    assert!(matches!(launcher.launch(&job).await?, LaunchOutcome::LostRace));

    let mut running = harness.job(&job.key()).await;
    running.status = SyncStatus::InProgress.to_string();
    assert!(matches!(
        launcher.launch(&running).await?,
        LaunchOutcome::AlreadyRunning { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn exhausted_directory_retries_error_the_job_and_fail_the_run() -> Result<()> {
    let harness = Harness::new().await?;
    let groups = [Uuid::new_v4(), Uuid::new_v4()];
    let job = harness
        .insert_job(sync_job(&format!("{};{}", groups[0], groups[1]), Uuid::new_v4()))
        .await?;
    let directory = Arc::new(FlakyDirectory::default());
    let aggregator = Arc::new(RecordingAggregatorClient::default());
    let retry = Harness::retry();
    let workflow = SyncOrchestrationWorkflow::new(OrchestrationContext {
        jobs: Arc::clone(&harness.jobs),
        checkpoints: Arc::clone(&harness.checkpoints),
        directory: directory.clone(),
        payloads: Arc::clone(&harness.payloads),
        notifier: harness.notifier.clone(),
        aggregator: aggregator.clone(),
        retry,
        dry_run: false,
    });

    let err = workflow.run(request(&job, 1, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestrationError::Directory(DirectoryError::Transient(_))
    ));

    // one existence check per group, each tried 1 + max_retries times
    let attempts = (retry.max_retries as usize + 1) * groups.len();
    assert_eq!(directory.calls.load(Ordering::SeqCst), attempts);
    assert!(aggregator.requests().is_empty());

    let stored = harness.job(&job.key()).await;
    assert_eq!(stored.sync_status()?, SyncStatus::Error);
    assert!(!stored.enabled);
    Ok(())
}

#[tokio::test]
async fn empty_query_array_errors_and_notifies() -> Result<()> {
    let harness = Harness::new().await?;
    let job = harness.insert_job(sync_job("[]", Uuid::new_v4())).await?;
    let aggregator = Arc::new(RecordingAggregatorClient::default());
    let workflow = harness.workflow(aggregator.clone());
    let launcher = OrchestrationLauncher::new(Arc::clone(&harness.jobs), workflow, 1, false);

    let LaunchOutcome::Launched {
        total_parts,
        handle,
        ..
    } = launcher.launch(&job).await?
    else {
        panic!("job should launch");
    };
    assert_eq!(total_parts, 1);

    let results = handle.await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap().phase, Phase::Error);
    assert!(aggregator.requests().is_empty());

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template_id, SYNC_DISABLED_NO_VALID_GROUP_IDS);

    let stored = harness.job(&job.key()).await;
    assert_eq!(stored.sync_status()?, SyncStatus::Error);
    assert!(!stored.enabled);
    Ok(())
}

#[tokio::test]
async fn empty_query_array_with_destination_part_leaves_the_group_alone() -> Result<()> {
    let harness = Harness::new().await?;
    let target = Uuid::new_v4();
    let current = users(5);
    harness.directory.put_group(target, &current).await;
    let mut job = sync_job("[]", target);
    job.threshold_percentage_for_removals = 100;
    let job = harness.insert_job(job).await?;

    let aggregator = harness.aggregator(Duration::hours(1));
    let workflow = harness.workflow(Arc::new(LocalAggregatorClient::new(Arc::clone(&aggregator))));
    let launcher = OrchestrationLauncher::new(Arc::clone(&harness.jobs), workflow, 1, true);

    let LaunchOutcome::Launched {
        total_parts,
        handle,
        ..
    } = launcher.launch(&job).await?
    else {
        panic!("job should launch");
    };
    assert_eq!(total_parts, 2);
    handle.await?;

    assert!(harness.writer.writes().is_empty());
    assert_eq!(harness.directory.members(target).await, current);
    assert_eq!(harness.job(&job.key()).await.sync_status()?, SyncStatus::Error);
    Ok(())
}

#[tokio::test]
async fn recovery_resumes_interrupted_runs() -> Result<()> {
    let harness = Harness::new().await?;
    let source = Uuid::new_v4();
    let target = Uuid::new_v4();
    let members = users(3);
    harness.directory.put_group(source, &members).await;
    harness.directory.put_group(target, &[]).await;
    let job = harness
        .insert_job(sync_job(&source.to_string(), target))
        .await?;

    let run_id = Uuid::new_v4();
    let job = claim(&harness, &job, run_id).await?;
    harness
        .checkpoints
        .save(&interrupted(&job, run_id, 1, 1))
        .await?;

    // a fresh process: nothing in flight, the job is not due
    assert!(harness.jobs.list_due_jobs(Utc::now() + Duration::days(365)).await?.is_empty());
    let aggregator = harness.aggregator(Duration::hours(1));
    let workflow = harness.workflow(Arc::new(LocalAggregatorClient::new(aggregator)));
    let launcher = OrchestrationLauncher::new(Arc::clone(&harness.jobs), workflow, 1, false);

    let mut recovered = launcher.recover().await?;
    assert_eq!(recovered.len(), 1);
    let RecoveryOutcome::Resumed {
        run_id: resumed,
        total_parts,
        handle,
        ..
    } = recovered.remove(0)
    else {
        panic!("run should resume");
    };
    assert_eq!(resumed, run_id);
    assert_eq!(total_parts, 1);

    let results = handle.await?;
    assert_eq!(results.len(), 1);
    let outcome = results[0].as_ref().unwrap();
    assert_eq!(outcome.run_id, run_id);
    assert_eq!(outcome.phase, Phase::Completed);

    let stored = harness.job(&job.key()).await;
    assert_eq!(stored.sync_status()?, SyncStatus::Idle);
    assert_eq!(stored.run_id, Some(run_id));
    assert_eq!(harness.directory.members(target).await, members);
    Ok(())
}

#[tokio::test]
async fn recovery_errors_runs_with_nothing_to_resume() -> Result<()> {
    let harness = Harness::new().await?;
    let orphan = harness
        .insert_job(sync_job(&Uuid::new_v4().to_string(), Uuid::new_v4()))
        .await?;
    let orphan = claim(&harness, &orphan, Uuid::new_v4()).await?;

    let finished = harness
        .insert_job(sync_job(&Uuid::new_v4().to_string(), Uuid::new_v4()))
        .await?;
    let finished_run = Uuid::new_v4();
    let finished = claim(&harness, &finished, finished_run).await?;
    let mut done = interrupted(&finished, finished_run, 1, 1);
    done.phase = Phase::Completed;
    done.finished_at = Some(Utc::now());
    harness.checkpoints.save(&done).await?;

    let idle = harness
        .insert_job(sync_job(&Uuid::new_v4().to_string(), Uuid::new_v4()))
        .await?;

    let workflow = harness.workflow(Arc::new(RecordingAggregatorClient::default()));
    let launcher = OrchestrationLauncher::new(Arc::clone(&harness.jobs), workflow, 1, false);
    let recovered = launcher.recover().await?;

    assert_eq!(recovered.len(), 2);
    assert!(
        recovered
            .iter()
            .all(|outcome| matches!(outcome, RecoveryOutcome::Abandoned { .. }))
    );
    for key in [orphan.key(), finished.key()] {
        let stored = harness.job(&key).await;
        assert_eq!(stored.sync_status()?, SyncStatus::Error);
        assert!(!stored.enabled);
    }
    assert_eq!(harness.job(&idle.key()).await.sync_status()?, SyncStatus::Idle);
    Ok(())
}
