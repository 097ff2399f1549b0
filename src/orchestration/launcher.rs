//! Starts one orchestration instance per part of a due job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use metrics::{counter, gauge};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::query::parse_query_parts;
use super::workflow::{
    OrchestrationError, OrchestrationOutcome, OrchestrationRequest, SyncOrchestrationWorkflow,
};
use crate::models::sync_job::Model as SyncJobModel;
use crate::models::{JobKey, SyncStatus};
use crate::repositories::{JobStatusUpdate, JobStore, JobStoreError};

pub type PartResult = Result<OrchestrationOutcome, OrchestrationError>;

#[derive(Debug)]
pub enum LaunchOutcome {
    Launched {
        run_id: Uuid,
        total_parts: u32,
        /// Resolves once every part finished
        handle: JoinHandle<Vec<PartResult>>,
    },
    /// A previous run of this job is still being driven by this process.
    AlreadyRunning { run_id: Uuid },
    /// Another writer claimed the job first.
    LostRace,
}

/// What the restart recovery did with one `InProgress` job.
#[derive(Debug)]
pub enum RecoveryOutcome {
    Resumed {
        job: JobKey,
        run_id: Uuid,
        total_parts: u32,
        handle: JoinHandle<Vec<PartResult>>,
    },
    /// Nothing could be resumed; the job was marked `Error`.
    Abandoned { job: JobKey, run_id: Option<Uuid> },
    AlreadyRunning { job: JobKey, run_id: Uuid },
}

/// Claims due jobs and drives their parts, at most `max_concurrency`
/// instances at a time.
pub struct OrchestrationLauncher {
    jobs: Arc<dyn JobStore>,
    workflow: Arc<SyncOrchestrationWorkflow>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<JobKey, Uuid>>>,
    include_destination_part: bool,
}

impl OrchestrationLauncher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        workflow: Arc<SyncOrchestrationWorkflow>,
        max_concurrency: usize,
        include_destination_part: bool,
    ) -> Self {
        Self {
            jobs,
            workflow,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            include_destination_part,
        }
    }

    pub fn workflow(&self) -> Arc<SyncOrchestrationWorkflow> {
        Arc::clone(&self.workflow)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|map| map.len()).unwrap_or_default()
    }

    /// Marks `job` `InProgress` under a new run id and spawns its parts.
    pub async fn launch(&self, job: &SyncJobModel) -> Result<LaunchOutcome, JobStoreError> {
        let key = job.key();
        if let Some(run_id) = self.running(&key) {
            info!(job = %key, run_id = %run_id, "Previous run still in flight; skipping launch");
            return Ok(LaunchOutcome::AlreadyRunning { run_id });
        }
        if matches!(job.sync_status(), Ok(SyncStatus::InProgress)) {
            return Ok(LaunchOutcome::AlreadyRunning {
                run_id: job.run_id.unwrap_or_default(),
            });
        }

        let run_id = Uuid::new_v4();
        let claimed = match self
            .jobs
            .update_job(job, JobStatusUpdate::new(SyncStatus::InProgress).with_run_id(run_id))
            .await
        {
            Ok(claimed) => claimed,
            Err(JobStoreError::Conflict { key }) => {
                warn!(job = %key, "Sync job claimed by another run; skipping launch");
                counter!("job_ownership_conflicts_total").increment(1);
                return Ok(LaunchOutcome::LostRace);
            }
            Err(err) => return Err(err),
        };

        let total_parts = self.total_parts(&claimed);
        info!(
            job = %key,
            run_id = %run_id,
            total_parts,
            target_group_id = %claimed.target_office_group_id,
            "Launching sync orchestration"
        );
        counter!("orchestration_launches_total").increment(1);

        let handle = self.spawn_parts(key, run_id, total_parts, self.include_destination_part);
        Ok(LaunchOutcome::Launched {
            run_id,
            total_parts,
            handle,
        })
    }

    /// Picks up jobs left `InProgress` by a previous process.
    ///
    /// A run with unfinished instances, undispatched commands or parts that
    /// never started is driven again under its stored run id; finished parts
    /// return straight from their checkpoint. A job with nothing left to
    /// resume is marked `Error`.
    pub async fn recover(&self) -> Result<Vec<RecoveryOutcome>, OrchestrationError> {
        let jobs = self.jobs.list_in_progress_jobs().await?;
        let mut outcomes = Vec::with_capacity(jobs.len());

        for job in jobs {
            let key = job.key();
            if let Some(run_id) = self.running(&key) {
                outcomes.push(RecoveryOutcome::AlreadyRunning { job: key, run_id });
                continue;
            }

            let Some(run_id) = job.run_id else {
                outcomes.push(self.abandon(&job, None, "no run id recorded").await?);
                continue;
            };
            let states = self.workflow.run_checkpoints(run_id).await?;
            let total_parts = states
                .iter()
                .map(|state| state.total_parts)
                .max()
                .unwrap_or_default();
            if states.is_empty() || total_parts == 0 {
                outcomes.push(self.abandon(&job, Some(run_id), "no checkpoint to resume").await?);
                continue;
            }

            let resumable = states.len() < total_parts as usize
                || states.iter().any(|state| {
                    !state.phase.is_terminal() || !state.pending_commands().is_empty()
                });
            if !resumable {
                outcomes.push(
                    self.abandon(&job, Some(run_id), "every part finished before the restart")
                        .await?,
                );
                continue;
            }

            let with_destination_part = states.iter().any(|state| state.is_destination_part)
                || total_parts as usize > parse_query_parts(&job.query).len();
            info!(job = %key, run_id = %run_id, total_parts, "Resuming interrupted sync orchestration");
            counter!("orchestration_recoveries_total").increment(1);
            let handle = self.spawn_parts(key.clone(), run_id, total_parts, with_destination_part);
            outcomes.push(RecoveryOutcome::Resumed {
                job: key,
                run_id,
                total_parts,
                handle,
            });
        }

        Ok(outcomes)
    }

    async fn abandon(
        &self,
        job: &SyncJobModel,
        run_id: Option<Uuid>,
        reason: &'static str,
    ) -> Result<RecoveryOutcome, OrchestrationError> {
        let key = job.key();
        error!(job = %key, run_id = ?run_id, reason, "Interrupted sync orchestration cannot be resumed; marking sync job as errored");

        let mut update = JobStatusUpdate::new(SyncStatus::Error);
        if let Some(run_id) = run_id {
            update = update.with_run_id(run_id);
        }
        match self.jobs.update_job(job, update).await {
            Ok(_) => {}
            Err(JobStoreError::Conflict { key } | JobStoreError::NotFound { key }) => {
                warn!(job = %key, "Sync job changed during recovery; status not updated");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(RecoveryOutcome::Abandoned { job: key, run_id })
    }

    fn total_parts(&self, job: &SyncJobModel) -> u32 {
        parse_query_parts(&job.query).len() as u32 + u32::from(self.include_destination_part)
    }

    /// Drives parts `1..=total_parts` of `run_id`; with a destination part it
    /// is the last one.
    fn spawn_parts(
        &self,
        key: JobKey,
        run_id: Uuid,
        total_parts: u32,
        with_destination_part: bool,
    ) -> JoinHandle<Vec<PartResult>> {
        self.track(key.clone(), run_id);

        let mut tasks = JoinSet::new();
        for part in 1..=total_parts {
            let request = OrchestrationRequest {
                job: key.clone(),
                run_id: Some(run_id),
                current_part: part,
                total_parts,
                is_destination_part: with_destination_part && part == total_parts,
            };
            let workflow = Arc::clone(&self.workflow);
            let permits = Arc::clone(&self.permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                workflow.run(request).await
            });
        }

        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let mut results = Vec::with_capacity(total_parts as usize);
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(join_err) => {
                        error!(run_id = %run_id, error = %join_err, "Orchestration task aborted")
                    }
                }
            }
            if let Ok(mut map) = in_flight.lock() {
                map.remove(&key);
                gauge!("orchestrations_in_flight").set(map.len() as f64);
            }
            results
        })
    }

    fn running(&self, key: &JobKey) -> Option<Uuid> {
        self.in_flight
            .lock()
            .ok()
            .and_then(|map| map.get(key).copied())
    }

    fn track(&self, key: JobKey, run_id: Uuid) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.insert(key, run_id);
            gauge!("orchestrations_in_flight").set(map.len() as f64);
        }
    }
}
