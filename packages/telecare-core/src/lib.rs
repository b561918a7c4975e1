//! # Telecare Core
//!
//! Client-side engine for two-party telehealth video calls: presence,
//! call lifecycle, media negotiation, and call history, with signaling
//! through a lightweight relay server.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     TELECARE CORE MODULES                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   Host UI                          Relay server (WebSocket)     │
//! │      │  dial / accept / reject          ▲                       │
//! │      │  hang up / mute / camera         │ SignalClientMessage   │
//! │      ▼                                  │                       │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │                     CallManager                        │    │
//! │  │                                                        │    │
//! │  │   CallSession ────── MediaNegotiator ────── History    │    │
//! │  │   (lifecycle          (offer/answer,        (outcome   │    │
//! │  │    state machine)      candidates)           records)  │    │
//! │  └───────────────────────────┬────────────────────────────┘    │
//! │                              │                                  │
//! │                              ▼                                  │
//! │                   MediaBackend / MediaSession                   │
//! │              (getUserMedia + RTCPeerConnection on web,          │
//! │               host-provided backend elsewhere)                  │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`signaling`] - Wire types for the relay protocol
//! - [`media`] - Device discovery and the peer-connection seam
//! - [`call`] - Call manager, session state machine, negotiator
//! - [`history`] - Call outcome records and the timeline sink
//! - [`time`] - Platform-aware time utilities
//!
//! ## Design Notes
//!
//! The manager is deliberately free of sockets and timers: the host
//! owns the WebSocket, parses frames into [`signaling`] types, feeds
//! them to the manager, and drains its two output channels. That keeps
//! the whole call lifecycle runnable under plain unit tests.

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod call;
pub mod error;
pub mod history;
pub mod media;
pub mod signaling;
/// Platform-aware time utilities for native and WASM targets.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use call::{CallConfig, CallEvent, CallManager, CallRole, CallState, EndReason};
pub use error::{Error, Result};
pub use history::{CallOutcomeRecord, HistoryRecorder, OutcomeStatus, TimelineStore};
pub use media::{DevicePolicy, IceCandidate, MediaBackend, MediaSession, SessionDescription};
pub use signaling::{SignalClientMessage, SignalServerMessage};
