//! Call session state machine.
//!
//! One [`CallSession`] tracks a single two-party call attempt from first
//! intent to final teardown:
//!
//! ```text
//!            dial                     answer received
//!   Idle ──────────▶ Dialing ───────────────────────────▶ Connected
//!    │                  │                                     │
//!    │ incoming offer   │ rejected / unavailable / timeout    │ hang up /
//!    ▼                  ▼                                     │ peer ended /
//!  Ringing ────────▶ Ending ◀─────────────────────────────────┘ transport lost
//!    │    accept ▶ Connected
//!    │    reject / timeout / cancel
//!    └────────────▶ Ending
//! ```
//!
//! Transitions not in the table are ignored by callers; a session that
//! has entered [`CallState::Ending`] latches there and every later
//! teardown input is a no-op.

use crate::time::now_timestamp;

/// Lifecycle state of a call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No call in progress.
    Idle,
    /// We sent an offer and are waiting for the remote party.
    Dialing,
    /// A remote offer arrived and is awaiting a local accept/reject.
    Ringing,
    /// Media is negotiated and the call is live.
    Connected,
    /// Teardown has started; no further transitions.
    Ending,
}

/// Which side of the call this client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallInput {
    Dial,
    OfferReceived,
    AnswerReceived,
    Accept,
    Reject,
    HangUp,
    PeerEnded,
    PeerRejected,
    PeerUnavailable,
    RingTimeout,
    TransportEstablished,
    TransportLost,
}

/// The transition table. Returns `None` for inputs that do not apply in
/// the current state; callers treat those as no-ops.
pub fn transition(state: CallState, input: CallInput) -> Option<CallState> {
    use CallInput::*;
    use CallState::*;

    match (state, input) {
        (Idle, Dial) => Some(Dialing),
        (Idle, OfferReceived) => Some(Ringing),

        (Dialing, AnswerReceived) => Some(Connected),
        (Dialing, PeerRejected) => Some(Ending),
        (Dialing, PeerUnavailable) => Some(Ending),
        (Dialing, RingTimeout) => Some(Ending),
        (Dialing, HangUp) => Some(Ending),
        (Dialing, PeerEnded) => Some(Ending),

        (Ringing, Accept) => Some(Connected),
        (Ringing, Reject) => Some(Ending),
        (Ringing, RingTimeout) => Some(Ending),
        (Ringing, PeerEnded) => Some(Ending),
        (Ringing, HangUp) => Some(Ending),

        (Connected, HangUp) => Some(Ending),
        (Connected, PeerEnded) => Some(Ending),
        (Connected, TransportLost) => Some(Ending),
        // Media layer confirming what signaling already established
        (Connected, TransportEstablished) => Some(Connected),

        _ => None,
    }
}

/// A single call attempt with one remote party.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub local_user_id: String,
    pub remote_user_id: String,
    /// Relay connection id of the remote party, once known.
    pub remote_connection_id: Option<String>,
    pub role: CallRole,
    pub state: CallState,
    /// Unix seconds when the attempt started.
    pub started_at: i64,
    /// Unix seconds when the call reached [`CallState::Connected`].
    pub connected_at: Option<i64>,
    /// Deadline (unix seconds) for an unanswered attempt.
    pub ring_deadline: i64,
    pub muted: bool,
    pub video_enabled: bool,
    /// Set once teardown has run; keeps end-of-call work idempotent.
    pub ended: bool,
}

impl CallSession {
    pub fn dialing(
        local_user_id: impl Into<String>,
        remote_user_id: impl Into<String>,
        ring_deadline: i64,
    ) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            remote_user_id: remote_user_id.into(),
            remote_connection_id: None,
            role: CallRole::Caller,
            state: CallState::Dialing,
            started_at: now_timestamp(),
            connected_at: None,
            ring_deadline,
            muted: false,
            video_enabled: true,
            ended: false,
        }
    }

    pub fn ringing(
        local_user_id: impl Into<String>,
        remote_user_id: impl Into<String>,
        remote_connection_id: impl Into<String>,
        ring_deadline: i64,
    ) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            remote_user_id: remote_user_id.into(),
            remote_connection_id: Some(remote_connection_id.into()),
            role: CallRole::Callee,
            state: CallState::Ringing,
            started_at: now_timestamp(),
            connected_at: None,
            ring_deadline,
            muted: false,
            video_enabled: true,
            ended: false,
        }
    }

    /// Apply an input. Returns the new state when the input applies,
    /// `None` when it is a no-op in the current state.
    pub fn apply(&mut self, input: CallInput) -> Option<CallState> {
        let next = transition(self.state, input)?;
        if next == CallState::Connected && self.connected_at.is_none() {
            self.connected_at = Some(now_timestamp());
        }
        self.state = next;
        Some(next)
    }

    /// Seconds the call spent connected; zero when it never connected.
    pub fn connected_duration(&self, now: i64) -> i64 {
        match self.connected_at {
            Some(connected_at) => (now - connected_at).max(0),
            None => 0,
        }
    }

    /// Whether the ring deadline has passed for a still-pending attempt.
    pub fn ring_expired(&self, now: i64) -> bool {
        matches!(self.state, CallState::Dialing | CallState::Ringing) && now >= self.ring_deadline
    }
}
