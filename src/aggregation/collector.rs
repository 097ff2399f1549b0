//! Per-session buffering of membership messages.
//!
//! Messages of one run share a session. Nothing leaves the buffer until the
//! message flagged as last arrives; then the whole session is drained and
//! handed back for merging.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use metrics::gauge;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{AzureAdGroup, AzureAdUser, GroupMembership, JobKey};

/// A received membership part and the lock token of its queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipMessage {
    pub lock_token: String,
    pub body: GroupMembership,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMembershipMessageResponse {
    /// True once the session is complete and its messages may be acknowledged
    pub should_complete_message: bool,
    pub completed_messages: Vec<MembershipMessage>,
}

#[derive(Debug)]
struct Session {
    messages: Vec<MembershipMessage>,
    last_seen: DateTime<Utc>,
}

/// A session abandoned by the sweeper.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredSession {
    pub session_id: Uuid,
    pub messages: Vec<MembershipMessage>,
}

#[derive(Debug, Default)]
pub struct SessionMessageCollector {
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl SessionMessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `message` under `session_id`. The last message drains the
    /// session.
    pub fn handle_new_message(
        &self,
        message: MembershipMessage,
        session_id: Uuid,
    ) -> GroupMembershipMessageResponse {
        let Ok(mut sessions) = self.sessions.lock() else {
            // poisoned buffer: deliver the message alone
            return GroupMembershipMessageResponse {
                should_complete_message: true,
                completed_messages: vec![message],
            };
        };

        let is_last = message.body.is_last_message;
        let session = sessions.entry(session_id).or_insert_with(|| Session {
            messages: Vec::new(),
            last_seen: message.received_at,
        });
        session.last_seen = session.last_seen.max(message.received_at);
        session.messages.push(message);

        let response = if is_last {
            let drained = sessions
                .remove(&session_id)
                .map(|session| session.messages)
                .unwrap_or_default();
            debug!(session_id = %session_id, messages = drained.len(), "Session complete");
            GroupMembershipMessageResponse {
                should_complete_message: true,
                completed_messages: drained,
            }
        } else {
            GroupMembershipMessageResponse {
                should_complete_message: false,
                completed_messages: Vec::new(),
            }
        };
        gauge!("aggregation_open_sessions").set(sessions.len() as f64);
        response
    }

    /// Removes sessions whose newest message is older than `timeout`.
    pub fn expire_stalled(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<ExpiredSession> {
        let Ok(mut sessions) = self.sessions.lock() else {
            return Vec::new();
        };
        let stalled: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, session)| session.last_seen + timeout <= now)
            .map(|(id, _)| *id)
            .collect();

        let expired = stalled
            .into_iter()
            .filter_map(|session_id| {
                sessions.remove(&session_id).map(|session| {
                    warn!(
                        session_id = %session_id,
                        messages = session.messages.len(),
                        last_seen = %session.last_seen,
                        "Session stalled without a last message; expiring"
                    );
                    ExpiredSession {
                        session_id,
                        messages: session.messages,
                    }
                })
            })
            .collect();
        gauge!("aggregation_open_sessions").set(sessions.len() as f64);
        expired
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .map(|sessions| sessions.len())
            .unwrap_or_default()
    }
}

/// All parts of one run folded into a single sync request.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedMembership {
    pub run_id: Uuid,
    pub job: JobKey,
    pub destination: AzureAdGroup,
    /// Distinct source users, in part order
    pub source_members: Vec<AzureAdUser>,
    /// Current destination members, when a destination part was collected
    pub destination_members: Option<Vec<AzureAdUser>>,
    /// Set when any part was produced in dry-run mode
    pub dry_run: bool,
    pub parts: usize,
    /// Parts that collected source groups, as opposed to the destination
    pub source_parts: usize,
}

/// Merges a completed session. Returns `None` for an empty one.
pub fn merge(messages: &[MembershipMessage]) -> Option<MergedMembership> {
    let mut ordered: Vec<&GroupMembership> = messages.iter().map(|message| &message.body).collect();
    ordered.sort_by_key(|body| body.part_number);
    let first = ordered.first()?;

    let mut seen = HashSet::new();
    let mut source_members = Vec::new();
    let mut destination_members: Option<Vec<AzureAdUser>> = None;
    let mut source_parts = 0;
    for body in &ordered {
        if body.is_destination_part {
            destination_members
                .get_or_insert_with(Vec::new)
                .extend(body.source_members.iter().copied());
            continue;
        }
        source_parts += 1;
        for user in &body.source_members {
            if seen.insert(user.object_id) {
                source_members.push(*user);
            }
        }
    }

    Some(MergedMembership {
        run_id: first.run_id,
        job: JobKey::new(
            first.sync_job_partition_key.clone(),
            first.sync_job_row_key.clone(),
        ),
        destination: first.destination,
        source_members,
        destination_members,
        dry_run: ordered
            .iter()
            .any(|body| body.membership_obtainer_dry_run_enabled),
        parts: ordered.len(),
        source_parts,
    })
}
