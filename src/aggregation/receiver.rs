//! Entry point of the aggregation stage.
//!
//! Each received part is read from the payload store, enqueued, and buffered
//! in its run's session. The part that completes the run's set of part
//! numbers closes the session; the merged membership is applied and every
//! message of the session is acknowledged, whatever the outcome.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::AggregationError;
use super::collector::{ExpiredSession, MembershipMessage, SessionMessageCollector, merge};
use super::queue::MessageQueue;
use super::updater::{MembershipUpdater, UpdateOutcome};
use crate::models::JobKey;
use crate::orchestration::aggregator_client::MembershipAggregatorRequest;
use crate::storage::MembershipPayloadStore;

#[derive(Debug, Clone, PartialEq)]
pub enum PartReceipt {
    /// Buffered; the run still misses parts.
    Buffered {
        run_id: Uuid,
        received: usize,
        expected: u32,
    },
    /// Already seen for this run, or the run is finished.
    Duplicate { run_id: Uuid },
    Completed {
        run_id: Uuid,
        messages: usize,
        outcome: UpdateOutcome,
    },
}

#[derive(Debug)]
struct RunProgress {
    job: JobKey,
    expected: u32,
    received: BTreeSet<u32>,
}

#[derive(Debug, Clone, PartialEq)]
enum ClosedState {
    Applying,
    Applied,
    Failed(String),
    /// Expired by the sweeper
    Abandoned,
}

#[derive(Debug)]
struct ClosedRun {
    state: ClosedState,
    closed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Runs {
    open: HashMap<Uuid, RunProgress>,
    closed: HashMap<Uuid, ClosedRun>,
}

impl Runs {
    fn close(&mut self, run_id: Uuid, state: ClosedState, at: DateTime<Utc>) {
        self.open.remove(&run_id);
        self.closed.insert(
            run_id,
            ClosedRun {
                state,
                closed_at: at,
            },
        );
    }
}

pub struct MembershipAggregator {
    payloads: Arc<dyn MembershipPayloadStore>,
    queue: Arc<dyn MessageQueue>,
    collector: SessionMessageCollector,
    updater: Arc<dyn MembershipUpdater>,
    runs: Mutex<Runs>,
    session_timeout: Duration,
}

impl MembershipAggregator {
    pub fn new(
        payloads: Arc<dyn MembershipPayloadStore>,
        queue: Arc<dyn MessageQueue>,
        updater: Arc<dyn MembershipUpdater>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            payloads,
            queue,
            collector: SessionMessageCollector::new(),
            updater,
            runs: Mutex::new(Runs::default()),
            session_timeout,
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.collector.open_sessions()
    }

    #[instrument(skip_all, fields(part = request.part_number, parts = request.parts_count))]
    pub async fn receive_part(
        &self,
        request: &MembershipAggregatorRequest,
    ) -> Result<PartReceipt, AggregationError> {
        if request.parts_count == 0
            || request.part_number == 0
            || request.part_number > request.parts_count
        {
            return Err(AggregationError::InvalidPart {
                reason: format!(
                    "part {} of {} is out of range",
                    request.part_number, request.parts_count
                ),
            });
        }

        let mut body = self.payloads.read(&request.file_path).await?;
        if body.sync_job_partition_key != request.partition_key
            || body.sync_job_row_key != request.row_key
        {
            return Err(AggregationError::InvalidPart {
                reason: format!(
                    "payload {} belongs to job {}/{}",
                    request.file_path, body.sync_job_partition_key, body.sync_job_row_key
                ),
            });
        }
        let run_id = body.run_id;
        counter!("aggregation_parts_received_total").increment(1);

        let response = {
            let mut runs = self.runs.lock().await;
            if let Some(closed) = runs.closed.get(&run_id) {
                return match &closed.state {
                    ClosedState::Applying => Err(AggregationError::SessionBusy { run_id }),
                    ClosedState::Failed(reason) => Err(AggregationError::SyncFailed {
                        run_id,
                        reason: reason.clone(),
                    }),
                    ClosedState::Applied | ClosedState::Abandoned => {
                        info!(run_id = %run_id, "Part arrived for a finished run; ignoring");
                        Ok(PartReceipt::Duplicate { run_id })
                    }
                };
            }

            if runs
                .open
                .get(&run_id)
                .is_some_and(|progress| progress.received.contains(&request.part_number))
            {
                info!(run_id = %run_id, "Duplicate delivery of part; ignoring");
                return Ok(PartReceipt::Duplicate { run_id });
            }

            // recorded only once queued, so a failed enqueue can be redelivered
            let lock_token = self.queue.enqueue(run_id).await?;
            let progress = runs.open.entry(run_id).or_insert_with(|| RunProgress {
                job: JobKey::new(request.partition_key.clone(), request.row_key.clone()),
                expected: request.parts_count,
                received: BTreeSet::new(),
            });
            progress.received.insert(request.part_number);
            let received = progress.received.len();
            let expected = progress.expected;
            let is_last = received as u32 >= expected;

            body.part_number = request.part_number;
            body.parts_count = request.parts_count;
            body.is_destination_part = request.is_destination_part;
            body.is_last_message = is_last;

            let message = MembershipMessage {
                lock_token,
                body,
                received_at: Utc::now(),
            };
            let response = self.collector.handle_new_message(message, run_id);

            if !response.should_complete_message {
                debug!(run_id = %run_id, received, expected, "Buffered membership part");
                return Ok(PartReceipt::Buffered {
                    run_id,
                    received,
                    expected,
                });
            }
            runs.close(run_id, ClosedState::Applying, Utc::now());
            response
        };

        let messages = response.completed_messages;
        let tokens: Vec<String> = messages.iter().map(|m| m.lock_token.clone()).collect();
        let applied = match merge(&messages) {
            Some(merged) => self.updater.apply(&merged).await,
            None => Err(AggregationError::InvalidPart {
                reason: "completed session has no messages".to_string(),
            }),
        };

        let state = match &applied {
            Ok(_) => ClosedState::Applied,
            Err(err) => ClosedState::Failed(err.to_string()),
        };
        self.runs.lock().await.close(run_id, state, Utc::now());
        self.queue.complete(&tokens).await?;

        let outcome = applied.map_err(|err| AggregationError::SyncFailed {
            run_id,
            reason: err.to_string(),
        })?;
        info!(run_id = %run_id, messages = messages.len(), outcome = ?outcome, "Membership session completed");
        Ok(PartReceipt::Completed {
            run_id,
            messages: messages.len(),
            outcome,
        })
    }

    /// Expires sessions without a last message for `session_timeout`.
    /// Their messages are acknowledged and their jobs marked errored.
    pub async fn expire_stalled_sessions(&self, now: DateTime<Utc>) -> usize {
        // under the runs lock so no part can reopen a session being expired
        let expired: Vec<(ExpiredSession, Option<JobKey>)> = {
            let mut runs = self.runs.lock().await;
            let expired = self.collector.expire_stalled(now, self.session_timeout);
            let expired = expired
                .into_iter()
                .map(|session| {
                    let job = runs
                        .open
                        .get(&session.session_id)
                        .map(|progress| progress.job.clone());
                    runs.close(session.session_id, ClosedState::Abandoned, now);
                    (session, job)
                })
                .collect();
            runs.closed.retain(|_, closed| {
                closed.state == ClosedState::Applying
                    || closed.closed_at + self.session_timeout > now
            });
            expired
        };
        let count = expired.len();

        for (session, job) in expired {
            let tokens: Vec<String> = session
                .messages
                .iter()
                .map(|m| m.lock_token.clone())
                .collect();
            if let Err(err) = self.queue.complete(&tokens).await {
                error!(run_id = %session.session_id, error = %err, "Failed to acknowledge expired session");
            }

            let job = job.or_else(|| {
                session.messages.first().map(|m| {
                    JobKey::new(
                        m.body.sync_job_partition_key.clone(),
                        m.body.sync_job_row_key.clone(),
                    )
                })
            });
            if let Some(job) = job
                && let Err(err) = self
                    .updater
                    .fail_session(&job, session.session_id, "session timed out before its last part")
                    .await
            {
                error!(run_id = %session.session_id, error = %err, "Failed to mark stalled sync job as errored");
            }
            counter!("aggregation_sessions_expired_total").increment(1);
        }

        count
    }

    /// Sweeps stalled sessions every `interval` until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: StdDuration, shutdown: CancellationToken) {
        info!(interval_seconds = interval.as_secs(), "Starting session sweeper");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Session sweeper received shutdown signal, stopping");
                    break;
                }
                _ = sleep(interval) => {
                    let expired = self.expire_stalled_sessions(Utc::now()).await;
                    if expired > 0 {
                        warn!(expired, "Expired stalled membership sessions");
                    }
                }
            }
        }
    }
}
