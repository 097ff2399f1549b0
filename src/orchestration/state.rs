//! Persisted orchestration state and its command outbox.
//!
//! Every transition records the side effects it causes as [`Command`]s in the
//! same checkpoint that records the new phase. Commands are dispatched after
//! the checkpoint is saved and marked once they ran, so a resumed instance
//! replays only commands that never completed and never re-emits one that
//! did.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AzureAdUser, JobKey, SyncStatus};

/// Orchestration phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Validating,
    ReadingSourceGroups,
    CollectingMembership,
    Deduplicating,
    Persisting,
    /// Payload handed to the aggregation stage
    CalculatingDelta,
    Completed,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validating => "Validating",
            Phase::ReadingSourceGroups => "ReadingSourceGroups",
            Phase::CollectingMembership => "CollectingMembership",
            Phase::Deduplicating => "Deduplicating",
            Phase::Persisting => "Persisting",
            Phase::CalculatingDelta => "CalculatingDelta",
            Phase::Completed => "Completed",
            Phase::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A side effect owed by a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Log {
        level: LogLevel,
        message: String,
        #[serde(default)]
        fields: BTreeMap<String, String>,
    },
    SendEmail {
        template_id: String,
        recipient: String,
        params: BTreeMap<String, String>,
    },
    UpdateJobStatus {
        status: SyncStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub seq: u32,
    pub phase: Phase,
    pub command: Command,
    pub dispatched: bool,
}

/// Membership read from one source group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupCollection {
    pub group_id: Uuid,
    pub users: Vec<AzureAdUser>,
    pub non_user_object_counts: BTreeMap<String, u64>,
    pub pages: u32,
}

/// The next phase plus the side effects of getting there.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: Phase,
    pub commands: Vec<Command>,
}

impl Transition {
    pub fn to(next: Phase) -> Self {
        Self {
            next,
            commands: Vec::new(),
        }
    }

    /// Terminal error transition that writes `status` to the job.
    pub fn fail(status: SyncStatus) -> Self {
        Self::to(Phase::Error).status(status)
    }

    pub fn log<I, K, V>(mut self, level: LogLevel, message: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.commands.push(Command::Log {
            level,
            message: message.into(),
            fields: fields
                .into_iter()
                .map(|(key, value)| (key.into(), value.to_string()))
                .collect(),
        });
        self
    }

    pub fn info(self, message: impl Into<String>) -> Self {
        self.log(LogLevel::Info, message, Vec::<(String, String)>::new())
    }

    pub fn email(
        mut self,
        template_id: &str,
        recipient: &str,
        params: BTreeMap<String, String>,
    ) -> Self {
        self.commands.push(Command::SendEmail {
            template_id: template_id.to_string(),
            recipient: recipient.to_string(),
            params,
        });
        self
    }

    pub fn status(mut self, status: SyncStatus) -> Self {
        self.commands.push(Command::UpdateJobStatus { status });
        self
    }
}

/// Checkpointed state of one orchestration instance (one part of one run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub instance_id: String,
    pub run_id: Uuid,
    pub job: JobKey,
    pub current_part: u32,
    pub total_parts: u32,
    pub is_destination_part: bool,
    pub phase: Phase,
    pub target_group_id: Uuid,
    pub requestor: String,
    pub dry_run: bool,
    /// Source string of this part, when the job query has one
    pub part_query: Option<String>,
    pub source_groups: Vec<Uuid>,
    pub collections: Vec<GroupCollection>,
    pub members: Vec<AzureAdUser>,
    pub payload_path: Option<String>,
    /// Status written by the terminal transition, if any
    pub final_status: Option<SyncStatus>,
    pub started_at: DateTime<Utc>,
    /// Set when the instance reaches a terminal phase
    pub finished_at: Option<DateTime<Utc>>,
    pub commands: Vec<CommandEntry>,
}

impl OrchestrationState {
    pub fn instance_id(run_id: Uuid, part: u32) -> String {
        format!("{}:{}", run_id, part)
    }

    /// Records a transition: moves to its phase and queues its commands.
    pub fn apply(&mut self, transition: Transition) {
        let phase = transition.next;
        for command in transition.commands {
            if let Command::UpdateJobStatus { status } = &command {
                self.final_status = Some(*status);
            }
            let seq = self.commands.len() as u32;
            self.commands.push(CommandEntry {
                seq,
                phase,
                command,
                dispatched: false,
            });
        }
        self.phase = phase;
        if phase.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Commands recorded but not yet dispatched, oldest first.
    pub fn pending_commands(&self) -> Vec<CommandEntry> {
        self.commands
            .iter()
            .filter(|entry| !entry.dispatched)
            .cloned()
            .collect()
    }

    pub fn mark_dispatched(&mut self, seq: u32) {
        if let Some(entry) = self.commands.iter_mut().find(|entry| entry.seq == seq) {
            entry.dispatched = true;
        }
    }

    /// `Validating`: part indices must be positive and in range.
    pub fn plan_validation(&self) -> Transition {
        if self.current_part == 0
            || self.total_parts == 0
            || self.current_part > self.total_parts
        {
            return Transition::fail(SyncStatus::Error).log(
                LogLevel::Error,
                "Found invalid value for CurrentPart or TotalParts",
                [
                    ("current_part", self.current_part.to_string()),
                    ("total_parts", self.total_parts.to_string()),
                ],
            );
        }

        Transition::to(Phase::ReadingSourceGroups).log(
            LogLevel::Info,
            format!(
                "Starting part {} of {} for destination group {}",
                self.current_part, self.total_parts, self.target_group_id
            ),
            [("is_destination_part", self.is_destination_part.to_string())],
        )
    }

    /// `ReadingSourceGroups`: resolves the group ids this part collects.
    pub fn plan_source_groups(&mut self) -> Transition {
        if self.is_destination_part {
            self.source_groups = vec![self.target_group_id];
            return Transition::to(Phase::CollectingMembership)
                .info("Reading destination group members");
        }

        let query = self.part_query.clone().unwrap_or_default();
        let parsed = super::query::parse_group_ids(&query);
        self.source_groups = parsed.valid;

        let mut transition = Transition::to(Phase::CollectingMembership);
        if !parsed.invalid.is_empty() {
            transition = transition.log(
                LogLevel::Warn,
                format!("Dropped {} malformed group id(s)", parsed.invalid.len()),
                [("invalid", parsed.invalid.join(";"))],
            );
        }

        if self.source_groups.is_empty() {
            let params = BTreeMap::from([
                ("destinationGroupId".to_string(), self.target_group_id.to_string()),
                ("query".to_string(), query),
            ]);
            return Transition {
                next: Phase::Error,
                commands: transition.commands,
            }
            .log(
                LogLevel::Error,
                "No valid source group ids; disabling sync job",
                [("destination_group_id", self.target_group_id.to_string())],
            )
            .email(
                crate::notifications::SYNC_DISABLED_NO_VALID_GROUP_IDS,
                &self.requestor,
                params,
            )
            .status(SyncStatus::Error);
        }

        transition.log(
            LogLevel::Info,
            format!("Reading {} source group(s)", self.source_groups.len()),
            [(
                "source_groups",
                self.source_groups
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>()
                    .join(";"),
            )],
        )
    }

    /// `Deduplicating`: merges collected users by id, first occurrence wins.
    pub fn plan_deduplication(&mut self) -> Transition {
        let mut seen = std::collections::HashSet::new();
        let mut members = Vec::new();
        let mut read = 0usize;
        for collection in &self.collections {
            read += collection.users.len();
            members.extend(collection.users.iter().filter(|user| seen.insert(**user)));
        }
        let duplicates = read - members.len();
        self.members = members;

        let query = self
            .source_groups
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(";");
        Transition::to(Phase::Persisting).log(
            LogLevel::Info,
            format!(
                "Found {} duplicate user(s). Read {} users from source groups {} to be synced into the destination group {}",
                duplicates, self.members.len(), query, self.target_group_id
            ),
            [("duplicates", duplicates.to_string())],
        )
    }
}
