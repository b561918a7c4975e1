//! UI-facing call events.
//!
//! The [`CallManager`](super::CallManager) emits these on its event
//! channel; the host UI renders them (ring screen, in-call view, toasts)
//! without ever touching signaling or media internals.

use crate::history::CallOutcomeRecord;
use crate::media::IceCandidate;

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// This side hung up or cancelled.
    LocalHangUp,
    /// The remote party ended or cancelled the call.
    RemoteEnded,
    /// The callee declined.
    Rejected,
    /// We declined an incoming call.
    LocalRejected,
    /// Nobody answered before the ring deadline.
    Unanswered,
    /// The target was not online.
    Unavailable,
    /// The media transport dropped and did not recover.
    TransportLost,
    /// Local capture could not start.
    MediaFailed,
}

/// Events the call manager reports to the host UI.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Registered with the relay; presence is now live.
    Registered { connection_id: String },
    /// The set of online users changed.
    OnlineUsersChanged { user_ids: Vec<String> },
    /// An outgoing call attempt started.
    Dialing { remote_user_id: String },
    /// An incoming call is waiting for accept/reject.
    IncomingCall { remote_user_id: String },
    /// Both sides negotiated; media is flowing.
    CallConnected { remote_user_id: String },
    /// The call is over. `record` is the outcome written to history.
    CallEnded {
        remote_user_id: String,
        reason: EndReason,
        record: Option<CallOutcomeRecord>,
    },
    /// The remote party recorded an outcome for a shared call.
    RemoteOutcome { record: CallOutcomeRecord },
    /// Local mute state changed.
    MuteChanged { muted: bool },
    /// Local camera state changed.
    VideoChanged { enabled: bool },
    /// A local ICE candidate was relayed (surfaced for diagnostics).
    CandidateSent { candidate: IceCandidate },
    /// Something went wrong outside a specific call's lifecycle.
    Error { message: String },
}

impl CallEvent {
    /// Whether this event belongs to an active call's lifecycle.
    pub fn is_call_lifecycle(&self) -> bool {
        matches!(
            self,
            CallEvent::Dialing { .. }
                | CallEvent::IncomingCall { .. }
                | CallEvent::CallConnected { .. }
                | CallEvent::CallEnded { .. }
        )
    }

    /// Whether this event should interrupt the user (ring, call ended).
    pub fn is_user_facing_alert(&self) -> bool {
        matches!(
            self,
            CallEvent::IncomingCall { .. } | CallEvent::CallEnded { .. } | CallEvent::Error { .. }
        )
    }
}
