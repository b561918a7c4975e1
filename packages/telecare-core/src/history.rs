//! # Call History
//!
//! Outcome records for finished call attempts and the timeline they are
//! written to.
//!
//! Every call attempt produces exactly one [`CallOutcomeRecord`] per
//! participant. The two sides classify the same attempt from their own
//! perspective: an unanswered call is "Missed" in the caller's history
//! and "Not Answered" in the callee's. Each side appends only its own
//! record to the host-provided [`TimelineStore`]; the copy relayed to
//! the remote party is for rendering, never for a second append.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::call::session::CallRole;
use crate::error::{Error, Result};
use crate::time::now_timestamp;

/// Final status of a call attempt, from one participant's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    /// The call connected and ran until someone hung up.
    Completed,
    /// An outgoing attempt that never connected (declined, timed out,
    /// or the target was offline).
    Missed,
    /// An incoming call that was never accepted.
    #[serde(rename = "Not Answered")]
    NotAnswered,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Completed => "Completed",
            OutcomeStatus::Missed => "Missed",
            OutcomeStatus::NotAnswered => "Not Answered",
        }
    }
}

/// Classify a finished attempt for this side of the call.
///
/// Connected attempts are `Completed` regardless of role; attempts that
/// never connected split by role so each history reads correctly.
pub fn classify(role: CallRole, connected: bool) -> OutcomeStatus {
    if connected {
        OutcomeStatus::Completed
    } else {
        match role {
            CallRole::Caller => OutcomeStatus::Missed,
            CallRole::Callee => OutcomeStatus::NotAnswered,
        }
    }
}

fn default_kind() -> String {
    "call".to_string()
}

/// One timeline entry describing a finished call attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcomeRecord {
    pub id: String,
    /// User id of the party who dialed.
    pub sender: String,
    /// User id of the party who was dialed.
    pub receiver: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub status: OutcomeStatus,
    /// Exact connected time in seconds; zero unless status is `Completed`.
    pub duration_seconds: i64,
    /// Unix seconds when the record was created.
    pub created_at: i64,
}

impl CallOutcomeRecord {
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        status: OutcomeStatus,
        duration_seconds: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            receiver: receiver.into(),
            kind: default_kind(),
            status,
            // Only completed calls carry time on the line
            duration_seconds: if status == OutcomeStatus::Completed {
                duration_seconds.max(0)
            } else {
                0
            },
            created_at: now_timestamp(),
        }
    }

    /// Duration rounded to whole minutes for display. A 125-second call
    /// shows as 2 minutes; a 25-second call as 0.
    pub fn duration_minutes(&self) -> i64 {
        (self.duration_seconds + 30) / 60
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::from)
    }
}

/// Host-provided sink for timeline entries.
///
/// The host owns persistence (its patient-record store, a local
/// database, whatever fits). Only locally produced records are
/// appended; records broadcast by the remote party arrive as
/// [`CallEvent::RemoteOutcome`](crate::call::CallEvent) events instead.
pub trait TimelineStore {
    fn append(&mut self, record: &CallOutcomeRecord) -> Result<()>;
}

/// Writes outcome records to a timeline store.
pub struct HistoryRecorder<S: TimelineStore> {
    store: S,
}

impl<S: TimelineStore> HistoryRecorder<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Build and append the record for a finished attempt. Returns the
    /// record so the caller can also relay it to the remote party.
    pub fn record(
        &mut self,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        role: CallRole,
        connected: bool,
        duration_seconds: i64,
    ) -> Result<CallOutcomeRecord> {
        let status = classify(role, connected);
        let record = CallOutcomeRecord::new(sender, receiver, status, duration_seconds);
        self.store
            .append(&record)
            .map_err(|e| Error::TimelineAppendFailed(e.to_string()))?;
        Ok(record)
    }
}
