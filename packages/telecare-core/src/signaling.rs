//! # Signaling Client
//!
//! Wire types for talking to the Telecare relay server.
//!
//! The relay speaks JSON over a persistent WebSocket. This module mirrors
//! the server's protocol enums; the transport itself (connecting the
//! socket, pumping frames) is owned by the host platform layer, which
//! feeds parsed [`SignalServerMessage`]s into the
//! [`CallManager`](crate::call::CallManager) and drains
//! [`SignalClientMessage`]s from its outbound channel.
//!
//! Offer/answer/candidate payloads travel as opaque JSON strings; the
//! relay never parses them, and this client serializes them with
//! [`crate::media::SessionDescription`] / [`crate::media::IceCandidate`].

use serde::{Deserialize, Serialize};

/// Messages sent from client to relay server.
/// Must match the relay server's `ClientMessage` enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalClientMessage {
    Register {
        user_id: String,
    },
    CallUser {
        to_user_id: String,
        offer: String,
    },
    MakeAnswer {
        to_connection_id: String,
        answer: String,
    },
    RejectCall {
        to_connection_id: String,
    },
    Candidate {
        to_connection_id: String,
        candidate: String,
    },
    EndCall {
        to_connection_id: String,
    },
    RecordOutcome {
        to_connection_id: String,
        record: String,
    },
    Ping,
}

/// Messages received from the relay server.
/// Must match the relay server's `ServerMessage` enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalServerMessage {
    Registered {
        user_id: String,
        connection_id: String,
    },
    OnlineUsers {
        user_ids: Vec<String>,
    },
    CallPlaced {
        to_user_id: String,
        to_connection_id: String,
    },
    IncomingCall {
        from_user_id: String,
        from_connection_id: String,
        offer: String,
    },
    AnswerMade {
        from_connection_id: String,
        answer: String,
    },
    CallRejected {
        from_connection_id: String,
    },
    CandidateReceived {
        from_connection_id: String,
        candidate: String,
    },
    CallEnded {
        from_connection_id: String,
    },
    UserUnavailable {
        user_id: String,
    },
    OutcomeRecorded {
        from_connection_id: String,
        record: String,
    },
    Pong,
    Error {
        message: String,
    },
}
