//! # Job Scheduler
//!
//! Background task that launches an orchestration for every due sync job on
//! each tick, and the start-time planning pass that spreads the job backlog
//! over the configured concurrency lanes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::JobSchedulerConfig;
use crate::orchestration::{LaunchOutcome, OrchestrationLauncher};
use crate::repositories::{JobStore, JobStoreError, WriteSummary};
use crate::scheduling::JobSchedulingService;

/// Background scheduler service.
pub struct JobScheduler {
    config: JobSchedulerConfig,
    jobs: Arc<dyn JobStore>,
    scheduling: JobSchedulingService,
    launcher: Arc<OrchestrationLauncher>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub jobs_due: u64,
    pub jobs_launched: u64,
    pub jobs_skipped_running: u64,
    pub jobs_lost_race: u64,
    pub jobs_with_errors: u64,
}

impl JobScheduler {
    pub fn new(
        config: JobSchedulerConfig,
        jobs: Arc<dyn JobStore>,
        scheduling: JobSchedulingService,
        launcher: Arc<OrchestrationLauncher>,
    ) -> Self {
        Self {
            config,
            jobs,
            scheduling,
            launcher,
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting job scheduler");
        let tick_interval = TokioDuration::from_secs(self.config.tick_interval_seconds);

        if self.config.reset_jobs || self.config.distribute_jobs {
            if let Err(err) = self.run_distribution_pass(Utc::now(), false).await {
                error!(error = %err, "Initial start time distribution failed");
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = %err, "Scheduler tick failed");
                    }
                    let elapsed = tick_started.elapsed();
                    histogram!("job_scheduler_tick_duration_ms")
                        .record(elapsed.as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Job scheduler stopped");
    }

    /// Launches every job due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickStats, JobStoreError> {
        let mut stats = TickStats::default();
        let due = self.jobs.list_due_jobs(now).await?;
        stats.jobs_due = due.len() as u64;

        for job in &due {
            match self.launcher.launch(job).await {
                Ok(LaunchOutcome::Launched {
                    run_id,
                    total_parts,
                    ..
                }) => {
                    stats.jobs_launched += 1;
                    debug!(job = %job.key(), run_id = %run_id, total_parts, "Launched due job");
                }
                Ok(LaunchOutcome::AlreadyRunning { .. }) => stats.jobs_skipped_running += 1,
                Ok(LaunchOutcome::LostRace) => stats.jobs_lost_race += 1,
                Err(err) => {
                    stats.jobs_with_errors += 1;
                    error!(error = %err, job = %job.key(), "Failed to launch sync job");
                }
            }
        }

        counter!("job_scheduler_launches_total").increment(stats.jobs_launched);
        gauge!("job_scheduler_due_gauge").set(stats.jobs_due as f64);
        gauge!("orchestrations_in_flight").set(self.launcher.in_flight_count() as f64);

        debug!(
            due = stats.jobs_due,
            launched = stats.jobs_launched,
            skipped_running = stats.jobs_skipped_running,
            lost_race = stats.jobs_lost_race,
            errors = stats.jobs_with_errors,
            "Scheduler tick completed"
        );

        Ok(stats)
    }

    /// Loads the enabled backlog, plans new start times and writes them back.
    /// Rows that changed since they were read are left alone.
    pub async fn run_distribution_pass(
        &self,
        now: DateTime<Utc>,
        force_all: bool,
    ) -> Result<WriteSummary, JobStoreError> {
        let backlog = self
            .scheduling
            .load_backlog(self.jobs.as_ref(), now, self.config.include_future_jobs)
            .await?;
        gauge!("job_scheduler_backlog_gauge").set(backlog.len() as f64);

        let planned = self
            .scheduling
            .plan_start_times(&backlog, &self.config, now, force_all)
            .await;
        let summary = self.jobs.update_start_times(&planned).await?;

        info!(
            backlog = backlog.len(),
            updated = summary.updated.len(),
            conflicts = summary.conflicts.len(),
            missing = summary.missing.len(),
            force_all,
            "Start time distribution pass completed"
        );
        Ok(summary)
    }
}
