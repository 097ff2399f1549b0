//! The sync orchestration state machine.
//!
//! One instance handles one part of one run. Each loop iteration dispatches
//! outstanding commands, executes the current phase and checkpoints the
//! resulting transition. An instance started again with the same run id and
//! part resumes from its last checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::aggregator_client::{AggregatorClient, MembershipAggregatorRequest};
use super::collector::{CollectionOutcome, collect_all};
use super::query::parse_query_parts;
use super::state::{Command, CommandEntry, LogLevel, OrchestrationState, Phase, Transition};
use crate::directory::{DirectoryError, DirectoryMembershipProvider};
use crate::models::sync_job::Model as SyncJobModel;
use crate::models::{AzureAdGroup, GroupMembership, JobKey, SyncStatus};
use crate::notifications::{NotificationError, NotificationSender};
use crate::repositories::{
    CheckpointError, CheckpointStore, JobStatusUpdate, JobStore, JobStoreError,
};
use crate::retry::RetryPolicy;
use crate::storage::{MembershipPayloadStore, StorageError, membership_payload_path};
use crate::telemetry::{RunContext, with_run_context};

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("sync job {key} not found")]
    JobNotFound { key: JobKey },
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("payload store error: {0}")]
    Payload(#[from] StorageError),
    #[error("notification error: {0}")]
    Notification(#[from] NotificationError),
}

/// Input of one orchestration instance.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationRequest {
    pub job: JobKey,
    /// Reuses the job's run id, or a new one, when absent
    pub run_id: Option<Uuid>,
    pub current_part: u32,
    pub total_parts: u32,
    pub is_destination_part: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct OrchestrationOutcome {
    pub run_id: Uuid,
    pub current_part: u32,
    #[schema(value_type = String)]
    pub phase: Phase,
    pub status: Option<SyncStatus>,
    pub payload_path: Option<String>,
}

/// Collaborators of the workflow.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub jobs: Arc<dyn JobStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub directory: Arc<dyn DirectoryMembershipProvider>,
    pub payloads: Arc<dyn MembershipPayloadStore>,
    pub notifier: Arc<dyn NotificationSender>,
    pub aggregator: Arc<dyn AggregatorClient>,
    pub retry: RetryPolicy,
    /// Service-wide dry run
    pub dry_run: bool,
}

pub struct SyncOrchestrationWorkflow {
    ctx: OrchestrationContext,
}

impl SyncOrchestrationWorkflow {
    pub fn new(ctx: OrchestrationContext) -> Self {
        Self { ctx }
    }

    /// Checkpointed instances of `run_id`, ordered by part.
    pub async fn run_checkpoints(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<OrchestrationState>, CheckpointError> {
        self.ctx.checkpoints.load_run(run_id).await
    }

    /// Runs (or resumes) one instance to a terminal phase.
    ///
    /// Unexpected failures are logged with the run id and part, the job is
    /// marked `Error`, and the error is returned to the caller.
    pub async fn run(
        &self,
        request: OrchestrationRequest,
    ) -> Result<OrchestrationOutcome, OrchestrationError> {
        let job = self
            .ctx
            .jobs
            .get_job(&request.job)
            .await?
            .ok_or_else(|| OrchestrationError::JobNotFound {
                key: request.job.clone(),
            })?;
        let run_id = request.run_id.or(job.run_id).unwrap_or_else(Uuid::new_v4);
        let part = request.current_part;
        let context = RunContext {
            run_id,
            current_part: Some(part),
        };
        let span = info_span!("orchestration", run_id = %run_id, part, job = %request.job);

        with_run_context(context, async {
            let started = Instant::now();
            let result = self.drive(&request, &job, run_id).await;
            histogram!("orchestration_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

            match result {
                Ok(outcome) => {
                    counter!("orchestrations_total", "phase" => outcome.phase.as_str()).increment(1);
                    Ok(outcome)
                }
                Err(err) => {
                    error!(
                        run_id = %run_id,
                        part,
                        error = %err,
                        "Caught unexpected exception in Part# {}, marking sync job as errored",
                        part
                    );
                    counter!("orchestration_failures_total").increment(1);
                    if let Err(update_err) =
                        self.update_job_status(&request.job, run_id, SyncStatus::Error).await
                    {
                        error!(run_id = %run_id, error = %update_err, "Failed to mark sync job as errored");
                    }
                    Err(err)
                }
            }
        })
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        request: &OrchestrationRequest,
        job: &SyncJobModel,
        run_id: Uuid,
    ) -> Result<OrchestrationOutcome, OrchestrationError> {
        let instance_id = OrchestrationState::instance_id(run_id, request.current_part);
        let mut state = match self.ctx.checkpoints.load(&instance_id).await? {
            Some(state) => {
                info!(phase = %state.phase, "Resuming orchestration from checkpoint");
                state
            }
            None => {
                let state = self.initial_state(request, job, run_id, instance_id);
                self.ctx.checkpoints.save(&state).await?;
                state
            }
        };

        loop {
            self.dispatch_pending(&mut state).await?;
            if state.phase.is_terminal() {
                break;
            }

            let from = state.phase;
            let transition = self.step(&mut state).await?;
            state.apply(transition);
            self.ctx.checkpoints.save(&state).await?;
            info!(from = %from, to = %state.phase, "Orchestration transition");
        }

        Ok(OrchestrationOutcome {
            run_id,
            current_part: state.current_part,
            phase: state.phase,
            status: state.final_status,
            payload_path: state.payload_path.clone(),
        })
    }

    fn initial_state(
        &self,
        request: &OrchestrationRequest,
        job: &SyncJobModel,
        run_id: Uuid,
        instance_id: String,
    ) -> OrchestrationState {
        let part_query = if request.is_destination_part {
            None
        } else {
            request
                .current_part
                .checked_sub(1)
                .and_then(|index| parse_query_parts(&job.query).into_iter().nth(index as usize))
        };

        OrchestrationState {
            instance_id,
            run_id,
            job: request.job.clone(),
            current_part: request.current_part,
            total_parts: request.total_parts,
            is_destination_part: request.is_destination_part,
            phase: Phase::Validating,
            target_group_id: job.target_office_group_id,
            requestor: job.requestor.clone(),
            dry_run: job.is_dry_run_enabled || self.ctx.dry_run,
            part_query,
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

    async fn step(&self, state: &mut OrchestrationState) -> Result<Transition, OrchestrationError> {
        match state.phase {
            Phase::Validating => Ok(state.plan_validation()),
            Phase::ReadingSourceGroups => Ok(state.plan_source_groups()),
            Phase::CollectingMembership => self.collect_membership(state).await,
            Phase::Deduplicating => Ok(state.plan_deduplication()),
            Phase::Persisting => self.persist_membership(state).await,
            Phase::CalculatingDelta => Ok(self.hand_off(state).await),
            Phase::Completed | Phase::Error => Ok(Transition::to(state.phase)),
        }
    }

    async fn collect_membership(
        &self,
        state: &mut OrchestrationState,
    ) -> Result<Transition, OrchestrationError> {
        let outcomes = collect_all(
            Arc::clone(&self.ctx.directory),
            self.ctx.retry,
            state.run_id,
            &state.source_groups,
        )
        .await?;

        let mut transition = Transition::to(Phase::Deduplicating);
        let mut collections = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                CollectionOutcome::GroupNotFound(group_id) => {
                    return Ok(Transition::fail(SyncStatus::SecurityGroupNotFound).log(
                        LogLevel::Error,
                        format!("Group with ID {} doesn't exist.", group_id),
                        [("group_id", group_id.to_string())],
                    ));
                }
                CollectionOutcome::Collected(collection) => {
                    let mut fields = vec![
                        ("group_id".to_string(), collection.group_id.to_string()),
                        ("pages".to_string(), collection.pages.to_string()),
                    ];
                    fields.extend(
                        collection
                            .non_user_object_counts
                            .iter()
                            .map(|(kind, count)| (format!("non_user.{}", kind), count.to_string())),
                    );
                    transition = transition.log(
                        LogLevel::Info,
                        format!(
                            "Read {} users from group {}",
                            collection.users.len(),
                            collection.group_id
                        ),
                        fields,
                    );
                    collections.push(collection);
                }
            }
        }

        state.collections = collections;
        Ok(transition)
    }

    async fn persist_membership(
        &self,
        state: &mut OrchestrationState,
    ) -> Result<Transition, OrchestrationError> {
        let membership = GroupMembership {
            destination: AzureAdGroup::new(state.target_group_id),
            source_members: state.members.clone(),
            run_id: state.run_id,
            sync_job_partition_key: state.job.partition_key.clone(),
            sync_job_row_key: state.job.row_key.clone(),
            membership_obtainer_dry_run_enabled: state.dry_run,
            part_number: state.current_part,
            parts_count: state.total_parts,
            is_last_message: false,
            is_destination_part: state.is_destination_part,
        };
        let path = membership_payload_path(
            state.target_group_id,
            state.run_id,
            state.current_part,
            Utc::now(),
        );

        let handle = self.ctx.payloads.write(&path, &membership).await?;
        state.payload_path = Some(handle.clone());

        Ok(Transition::to(Phase::CalculatingDelta).log(
            LogLevel::Info,
            "Persisted membership payload",
            [("path", handle), ("members", state.members.len().to_string())],
        ))
    }

    async fn hand_off(&self, state: &OrchestrationState) -> Transition {
        let Some(file_path) = state.payload_path.clone() else {
            return Transition::fail(SyncStatus::Error)
                .log(LogLevel::Error, "No membership payload to hand off", Vec::<(String, String)>::new());
        };

        let request = MembershipAggregatorRequest {
            file_path,
            part_number: state.current_part,
            parts_count: state.total_parts,
            partition_key: state.job.partition_key.clone(),
            row_key: state.job.row_key.clone(),
            is_destination_part: state.is_destination_part,
        };

        match self.ctx.aggregator.submit(&request, state.run_id).await {
            Ok(()) => Transition::to(Phase::Completed).info("Membership part handed to aggregator"),
            Err(err) => Transition::fail(SyncStatus::Error).log(
                LogLevel::Error,
                "Membership aggregator call failed",
                [("error", err.to_string())],
            ),
        }
    }

    async fn dispatch_pending(
        &self,
        state: &mut OrchestrationState,
    ) -> Result<(), OrchestrationError> {
        for entry in state.pending_commands() {
            self.dispatch(state, &entry).await?;
            state.mark_dispatched(entry.seq);
            self.ctx.checkpoints.save(state).await?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        state: &OrchestrationState,
        entry: &CommandEntry,
    ) -> Result<(), OrchestrationError> {
        match &entry.command {
            Command::Log {
                level,
                message,
                fields,
            } => {
                emit_log(state, entry.phase, *level, message, fields);
                Ok(())
            }
            Command::SendEmail {
                template_id,
                recipient,
                params,
            } => {
                self.ctx
                    .notifier
                    .send(template_id, recipient, &[], params, state.run_id)
                    .await?;
                Ok(())
            }
            Command::UpdateJobStatus { status } => {
                self.update_job_status(&state.job, state.run_id, *status).await
            }
        }
    }

    /// Conditional status write; a lost race is logged and ignored.
    async fn update_job_status(
        &self,
        key: &JobKey,
        run_id: Uuid,
        status: SyncStatus,
    ) -> Result<(), OrchestrationError> {
        let Some(job) = self.ctx.jobs.get_job(key).await? else {
            warn!(job = %key, "Sync job no longer exists; status not updated");
            return Ok(());
        };

        if let Some(owner) = job.run_id.filter(|owner| *owner != run_id) {
            warn!(job = %key, owner = %owner, status = %status, "Sync job is owned by another run; status not updated");
            counter!("job_ownership_conflicts_total").increment(1);
            return Ok(());
        }

        match self
            .ctx
            .jobs
            .update_job(&job, JobStatusUpdate::new(status).with_run_id(run_id))
            .await
        {
            Ok(_) => Ok(()),
            Err(JobStoreError::Conflict { key }) => {
                warn!(job = %key, status = %status, "Lost race updating sync job status");
                counter!("job_ownership_conflicts_total").increment(1);
                Ok(())
            }
            Err(JobStoreError::NotFound { key }) => {
                warn!(job = %key, "Sync job removed during status update");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn emit_log(
    state: &OrchestrationState,
    phase: Phase,
    level: LogLevel,
    message: &str,
    fields: &BTreeMap<String, String>,
) {
    let run_id = state.run_id;
    let part = state.current_part;
    let phase = phase.as_str();
    match level {
        LogLevel::Info => info!(run_id = %run_id, part, phase, fields = ?fields, "{}", message),
        LogLevel::Warn => warn!(run_id = %run_id, part, phase, fields = ?fields, "{}", message),
        LogLevel::Error => error!(run_id = %run_id, part, phase, fields = ?fields, "{}", message),
    }
}
