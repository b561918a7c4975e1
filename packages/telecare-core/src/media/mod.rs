//! # Media Layer
//!
//! Device discovery and peer-connection plumbing behind a portable seam.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Media Layer                        │
//! │                                                         │
//! │   ┌──────────────┐     ┌─────────────────────────────┐  │
//! │   │ MediaBackend │────▶│ MediaSession                │  │
//! │   │  (devices,   │     │  (one peer connection:      │  │
//! │   │   capture)   │     │   offer/answer, candidates, │  │
//! │   └──────────────┘     │   tracks, close)            │  │
//! │                        └─────────────────────────────┘  │
//! │                                    │                    │
//! │                                    ▼                    │
//! │                        MediaEvent stream (candidates,   │
//! │                        transport state, track ended)    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The traits here are what the call negotiator drives. On wasm32 the
//! [`web`] module implements them over the browser's getUserMedia and
//! RTCPeerConnection APIs; native hosts plug in their own backend.
//! Nothing above this seam knows which transport is underneath.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[cfg(target_arch = "wasm32")]
pub mod web;

// ── Wire payloads ──────────────────────────────────────────────────────────

/// A session description exchanged through the relay.
///
/// `sdp_type` is "offer" or "answer"; the SDP body is carried verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescription {
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate exchanged through the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

// ── Devices ────────────────────────────────────────────────────────────────

/// Kind of capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

/// A capture device as reported by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// Which devices to prefer when more than one is available.
///
/// Clinical carts often expose a built-in webcam at index 0 and the
/// exam camera at index 1; preferring index 1 picks the exam camera
/// when present and falls back to the last device otherwise.
#[derive(Debug, Clone, Copy)]
pub struct DevicePolicy {
    pub preferred_video_index: usize,
}

impl Default for DevicePolicy {
    fn default() -> Self {
        Self {
            preferred_video_index: 1,
        }
    }
}

impl DevicePolicy {
    /// Choose a video device from the enumerated list, clamping the
    /// preferred index to the list length. Returns `None` when the list
    /// is empty.
    pub fn select_video<'a>(&self, devices: &'a [MediaDeviceInfo]) -> Option<&'a MediaDeviceInfo> {
        let videos: Vec<&MediaDeviceInfo> = devices
            .iter()
            .filter(|d| d.kind == DeviceKind::VideoInput)
            .collect();
        if videos.is_empty() {
            return None;
        }
        let index = self.preferred_video_index.min(videos.len() - 1);
        Some(videos[index])
    }
}

// ── Events ─────────────────────────────────────────────────────────────────

/// Events emitted by a live [`MediaSession`].
///
/// `generation` on local candidates is a per-session counter so
/// candidates can be relayed in discovery order even if the platform
/// delivers callbacks out of turn.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LocalCandidate {
        generation: u64,
        candidate: IceCandidate,
    },
    TransportConnected,
    TransportDisconnected,
    TransportFailed,
    RemoteTrackEnded,
}

impl MediaEvent {
    /// Whether this event means the transport is no longer usable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MediaEvent::TransportFailed | MediaEvent::TransportDisconnected
        )
    }
}

// ── Seam traits ────────────────────────────────────────────────────────────

/// Platform entry point: enumerates devices and opens capture sessions.
#[async_trait(?Send)]
pub trait MediaBackend {
    type Session: MediaSession;

    /// List capture devices currently visible to the platform.
    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>>;

    /// Acquire local capture and create a fresh peer connection.
    ///
    /// Fails with a device error ([`Error::NoCamera`](crate::error::Error::NoCamera),
    /// [`Error::NoMicrophone`](crate::error::Error::NoMicrophone),
    /// [`Error::PermissionDenied`](crate::error::Error::PermissionDenied))
    /// when capture cannot start.
    async fn open_session(&self, policy: DevicePolicy) -> Result<Self::Session>;
}

/// One peer connection with attached local capture.
///
/// Created by [`MediaBackend::open_session`]; driven by the call
/// negotiator. `close` is synchronous and idempotent so teardown never
/// has to await a platform that may already be gone.
#[async_trait(?Send)]
pub trait MediaSession {
    /// Produce a local offer and set it as the local description.
    async fn create_offer(&mut self) -> Result<SessionDescription>;

    /// Produce a local answer and set it as the local description.
    /// Requires the remote offer to already be applied.
    async fn create_answer(&mut self) -> Result<SessionDescription>;

    /// Apply the remote peer's description.
    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate. Callers must not invoke this before
    /// `set_remote_description`; the negotiator buffers early arrivals.
    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()>;

    /// Enable or disable the local audio track.
    fn set_audio_enabled(&mut self, enabled: bool);

    /// Enable or disable the local video track.
    fn set_video_enabled(&mut self, enabled: bool);

    /// Take the next pending event, if any.
    fn poll_event(&mut self) -> Option<MediaEvent>;

    /// Stop capture tracks and close the peer connection. Safe to call
    /// more than once.
    fn close(&mut self);
}
