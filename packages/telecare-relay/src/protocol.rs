//! Relay protocol message definitions.
//!
//! The relay speaks a simple JSON-over-WebSocket protocol.
//! Offer, answer, candidate, and outcome payloads are opaque strings;
//! the relay routes them without ever parsing their content.

use serde::{Deserialize, Serialize};

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register this WebSocket connection with a durable user id.
    /// Must be sent first after connecting. A user registering from a new
    /// connection replaces any previous mapping (last-connect-wins).
    Register {
        user_id: String,
    },

    /// Start a call: look up the target user and forward the session
    /// description offer to them. If the target has no live connection,
    /// the relay replies with `UserUnavailable`. Terminal, no ring.
    CallUser {
        to_user_id: String,
        offer: String,
    },

    /// Deliver an answer to the caller's connection (callee accepted).
    MakeAnswer {
        to_connection_id: String,
        answer: String,
    },

    /// Notify the caller's connection that the call was declined.
    RejectCall {
        to_connection_id: String,
    },

    /// Forward one connectivity candidate to the peer's connection.
    Candidate {
        to_connection_id: String,
        candidate: String,
    },

    /// Notify the peer's connection that the call is over.
    EndCall {
        to_connection_id: String,
    },

    /// Broadcast a call outcome record to the peer's connection so both
    /// chat timelines render the same attempt without a separate fetch.
    RecordOutcome {
        to_connection_id: String,
        record: String,
    },

    /// Ping to keep connection alive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement of successful registration, carrying the ephemeral
    /// connection id assigned to this WebSocket.
    Registered {
        user_id: String,
        connection_id: String,
    },

    /// Best-effort presence: ids of all users with a live connection.
    /// Sent to every client on each register/disconnect. Not authoritative
    /// for call routing; `CallUser` does its own lookup.
    OnlineUsers {
        user_ids: Vec<String>,
    },

    /// Reply to a successful `CallUser`: the callee was found and the
    /// offer forwarded. `to_connection_id` is the resolved address the
    /// caller must use for candidates and teardown.
    CallPlaced {
        to_user_id: String,
        to_connection_id: String,
    },

    /// An incoming call offer. `from_connection_id` is the address the
    /// callee must use for all replies (answer, candidates, end).
    IncomingCall {
        from_user_id: String,
        from_connection_id: String,
        offer: String,
    },

    /// The callee accepted and produced an answer.
    AnswerMade {
        from_connection_id: String,
        answer: String,
    },

    /// The callee declined the call.
    CallRejected {
        from_connection_id: String,
    },

    /// A connectivity candidate forwarded from the peer.
    CandidateReceived {
        from_connection_id: String,
        candidate: String,
    },

    /// The peer ended the call (or their connection dropped and the relay
    /// synthesized this on their behalf).
    CallEnded {
        from_connection_id: String,
    },

    /// The target of a `CallUser` has no live connection. Terminal for
    /// the attempt; the callee never observed it.
    UserUnavailable {
        user_id: String,
    },

    /// A call outcome record broadcast from the peer's client.
    OutcomeRecorded {
        from_connection_id: String,
        record: String,
    },

    /// Pong response to keep connection alive.
    Pong,

    /// Error response.
    Error {
        message: String,
    },
}
