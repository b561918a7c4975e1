//! # Browser Media Backend
//!
//! [`MediaBackend`] implementation over the browser's `getUserMedia` and
//! `RTCPeerConnection` APIs via `web-sys`.
//!
//! ## Event Flow
//!
//! ```text
//! RTCPeerConnection callbacks          WebMediaSession
//! ──────────────────────────          ───────────────
//! onicecandidate ──────────────────▶  queue LocalCandidate { generation }
//! oniceconnectionstatechange ──────▶  queue TransportConnected / Failed / ...
//! ontrack → track.onended ─────────▶  queue RemoteTrackEnded
//!                                           │
//!                                           ▼
//!                                     poll_event() drains in order
//! ```
//!
//! Candidates are trickled: each one is queued the moment the browser
//! discovers it, stamped with a monotonic generation so the caller can
//! relay them in discovery order.

#![cfg(target_arch = "wasm32")]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use send_wrapper::SendWrapper;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use crate::error::{Error, Result};
use crate::media::{
    DeviceKind, DevicePolicy, IceCandidate, MediaBackend, MediaDeviceInfo, MediaEvent,
    MediaSession, SessionDescription,
};

/// STUN servers for ICE candidate gathering
const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ── Backend ────────────────────────────────────────────────────────────────

/// Media backend for browser hosts.
pub struct WebMediaBackend;

impl WebMediaBackend {
    pub fn new() -> Self {
        Self
    }

    fn media_devices() -> Result<web_sys::MediaDevices> {
        let window = web_sys::window().ok_or_else(|| Error::Internal("No window".to_string()))?;
        window
            .navigator()
            .media_devices()
            .map_err(|e| Error::Internal(format!("MediaDevices unavailable: {:?}", e)))
    }
}

impl Default for WebMediaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl MediaBackend for WebMediaBackend {
    type Session = WebMediaSession;

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
        let devices = Self::media_devices()?;
        let promise = devices
            .enumerate_devices()
            .map_err(|e| Error::Internal(format!("enumerateDevices failed: {:?}", e)))?;
        let list = JsFuture::from(promise)
            .await
            .map_err(|e| Error::Internal(format!("enumerateDevices rejected: {:?}", e)))?;

        let array = js_sys::Array::from(&list);
        let mut result = Vec::new();
        for entry in array.iter() {
            let info: web_sys::MediaDeviceInfo = entry.unchecked_into();
            let kind = match info.kind() {
                web_sys::MediaDeviceKind::Audioinput => DeviceKind::AudioInput,
                web_sys::MediaDeviceKind::Videoinput => DeviceKind::VideoInput,
                // Output devices are irrelevant to capture
                _ => continue,
            };
            result.push(MediaDeviceInfo {
                device_id: info.device_id(),
                kind,
                label: info.label(),
            });
        }
        Ok(result)
    }

    async fn open_session(&self, policy: DevicePolicy) -> Result<WebMediaSession> {
        let devices = self.enumerate_devices().await?;

        if !devices.iter().any(|d| d.kind == DeviceKind::AudioInput) {
            return Err(Error::NoMicrophone);
        }
        let video = policy.select_video(&devices).ok_or(Error::NoCamera)?;

        let media_devices = Self::media_devices()?;
        let constraints = web_sys::MediaStreamConstraints::new();
        constraints.set_audio(&JsValue::TRUE);
        let video_constraints = web_sys::MediaTrackConstraints::new();
        video_constraints.set_device_id(&JsValue::from_str(&video.device_id));
        constraints.set_video(&video_constraints.into());

        let promise = media_devices
            .get_user_media_with_constraints(&constraints)
            .map_err(|e| Error::DeviceFailed(format!("getUserMedia failed: {:?}", e)))?;
        let stream = JsFuture::from(promise)
            .await
            .map_err(map_get_user_media_error)?;
        let stream: web_sys::MediaStream = stream.unchecked_into();

        WebMediaSession::new(stream)
    }
}

/// Map a getUserMedia rejection onto the device error taxonomy.
fn map_get_user_media_error(err: JsValue) -> Error {
    let name = js_sys::Reflect::get(&err, &JsValue::from_str("name"))
        .ok()
        .and_then(|n| n.as_string())
        .unwrap_or_default();
    match name.as_str() {
        "NotAllowedError" | "SecurityError" => Error::PermissionDenied(name),
        "NotFoundError" | "OverconstrainedError" => Error::NoCamera,
        _ => Error::DeviceFailed(format!("getUserMedia rejected: {:?}", err)),
    }
}

// ── Session ────────────────────────────────────────────────────────────────

/// Shared state between the RTCPeerConnection callbacks and the session.
struct SessionShared {
    events: VecDeque<MediaEvent>,
    next_generation: u64,
}

/// One browser peer connection with local capture attached.
pub struct WebMediaSession {
    pc: SendWrapper<web_sys::RtcPeerConnection>,
    local_stream: SendWrapper<web_sys::MediaStream>,
    shared: Arc<Mutex<SessionShared>>,
    closed: bool,
    // Stored closures to prevent GC
    _onicecandidate: SendWrapper<Closure<dyn FnMut(web_sys::RtcPeerConnectionIceEvent)>>,
    _onstatechange: SendWrapper<Closure<dyn FnMut(web_sys::Event)>>,
    _ontrack: SendWrapper<Closure<dyn FnMut(web_sys::RtcTrackEvent)>>,
}

impl WebMediaSession {
    fn new(local_stream: web_sys::MediaStream) -> Result<Self> {
        let pc = create_peer_connection()
            .map_err(|e| Error::Internal(format!("Failed to create RTCPeerConnection: {:?}", e)))?;

        // Attach capture tracks before any negotiation
        let tracks = local_stream.get_tracks();
        for track in tracks.iter() {
            let track: web_sys::MediaStreamTrack = track.unchecked_into();
            let _sender = pc.add_track(&track, &local_stream, &js_sys::Array::new());
        }

        let shared = Arc::new(Mutex::new(SessionShared {
            events: VecDeque::new(),
            next_generation: 0,
        }));

        // onicecandidate: trickle candidates as they are discovered
        let shared_clone = shared.clone();
        let onicecandidate =
            Closure::wrap(Box::new(move |event: web_sys::RtcPeerConnectionIceEvent| {
                // null candidate marks end of gathering; nothing to relay
                if let Some(candidate) = event.candidate() {
                    let mut s = shared_clone.lock();
                    let generation = s.next_generation;
                    s.next_generation += 1;
                    s.events.push_back(MediaEvent::LocalCandidate {
                        generation,
                        candidate: IceCandidate {
                            candidate: candidate.candidate(),
                            sdp_mid: candidate.sdp_mid(),
                            sdp_m_line_index: candidate.sdp_m_line_index(),
                        },
                    });
                }
            }) as Box<dyn FnMut(web_sys::RtcPeerConnectionIceEvent)>);
        pc.set_onicecandidate(Some(onicecandidate.as_ref().unchecked_ref()));

        // oniceconnectionstatechange: map ICE state onto transport events
        let shared_clone = shared.clone();
        let pc_for_state = pc.clone();
        let onstatechange = Closure::wrap(Box::new(move |_: web_sys::Event| {
            let event = match pc_for_state.ice_connection_state() {
                web_sys::RtcIceConnectionState::Connected
                | web_sys::RtcIceConnectionState::Completed => Some(MediaEvent::TransportConnected),
                web_sys::RtcIceConnectionState::Disconnected => {
                    Some(MediaEvent::TransportDisconnected)
                }
                web_sys::RtcIceConnectionState::Failed => Some(MediaEvent::TransportFailed),
                _ => None,
            };
            if let Some(event) = event {
                shared_clone.lock().events.push_back(event);
            }
        }) as Box<dyn FnMut(web_sys::Event)>);
        pc.set_oniceconnectionstatechange(Some(onstatechange.as_ref().unchecked_ref()));

        // ontrack: watch remote tracks so a stopped camera surfaces as an event
        let shared_clone = shared.clone();
        let ontrack = Closure::wrap(Box::new(move |event: web_sys::RtcTrackEvent| {
            let track = event.track();
            let shared_inner = shared_clone.clone();
            let onended = Closure::wrap(Box::new(move |_: web_sys::Event| {
                shared_inner.lock().events.push_back(MediaEvent::RemoteTrackEnded);
            }) as Box<dyn FnMut(web_sys::Event)>);
            track.set_onended(Some(onended.as_ref().unchecked_ref()));
            onended.forget();
        }) as Box<dyn FnMut(web_sys::RtcTrackEvent)>);
        pc.set_ontrack(Some(ontrack.as_ref().unchecked_ref()));

        Ok(Self {
            pc: SendWrapper::new(pc),
            local_stream: SendWrapper::new(local_stream),
            shared,
            closed: false,
            _onicecandidate: SendWrapper::new(onicecandidate),
            _onstatechange: SendWrapper::new(onstatechange),
            _ontrack: SendWrapper::new(ontrack),
        })
    }

    fn set_tracks_enabled(&self, tracks: js_sys::Array, enabled: bool) {
        for track in tracks.iter() {
            let track: web_sys::MediaStreamTrack = track.unchecked_into();
            track.set_enabled(enabled);
        }
    }
}

#[async_trait(?Send)]
impl MediaSession for WebMediaSession {
    async fn create_offer(&mut self) -> Result<SessionDescription> {
        let offer = JsFuture::from(self.pc.create_offer())
            .await
            .map_err(|e| Error::NegotiationFailed(format!("createOffer failed: {:?}", e)))?;
        let offer_desc = offer.unchecked_into::<web_sys::RtcSessionDescriptionInit>();
        JsFuture::from(self.pc.set_local_description(&offer_desc))
            .await
            .map_err(|e| {
                Error::NegotiationFailed(format!("setLocalDescription failed: {:?}", e))
            })?;
        let local = self
            .pc
            .local_description()
            .ok_or_else(|| Error::NegotiationFailed("No local description".to_string()))?;
        Ok(SessionDescription::offer(local.sdp()))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        if self.pc.remote_description().is_none() {
            return Err(Error::DescriptionNotSet);
        }
        let answer = JsFuture::from(self.pc.create_answer())
            .await
            .map_err(|e| Error::NegotiationFailed(format!("createAnswer failed: {:?}", e)))?;
        let answer_desc = answer.unchecked_into::<web_sys::RtcSessionDescriptionInit>();
        JsFuture::from(self.pc.set_local_description(&answer_desc))
            .await
            .map_err(|e| {
                Error::NegotiationFailed(format!("setLocalDescription failed: {:?}", e))
            })?;
        let local = self
            .pc
            .local_description()
            .ok_or_else(|| Error::NegotiationFailed("No local description".to_string()))?;
        Ok(SessionDescription::answer(local.sdp()))
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        let sdp_type = match description.sdp_type.as_str() {
            "offer" => web_sys::RtcSdpType::Offer,
            "answer" => web_sys::RtcSdpType::Answer,
            other => {
                return Err(Error::NegotiationFailed(format!(
                    "Unknown SDP type: {}",
                    other
                )))
            }
        };
        let remote_desc = web_sys::RtcSessionDescriptionInit::new(sdp_type);
        remote_desc.set_sdp(&description.sdp);
        JsFuture::from(self.pc.set_remote_description(&remote_desc))
            .await
            .map_err(|e| {
                Error::NegotiationFailed(format!("setRemoteDescription failed: {:?}", e))
            })?;
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.pc.remote_description().is_none() {
            return Err(Error::DescriptionNotSet);
        }
        let init = web_sys::RtcIceCandidateInit::new(&candidate.candidate);
        if let Some(ref mid) = candidate.sdp_mid {
            init.set_sdp_mid(Some(mid));
        }
        if let Some(idx) = candidate.sdp_m_line_index {
            init.set_sdp_m_line_index(Some(idx));
        }
        let ice_candidate = web_sys::RtcIceCandidate::new(&init)
            .map_err(|e| Error::NegotiationFailed(format!("Invalid ICE candidate: {:?}", e)))?;
        let promise = self
            .pc
            .add_ice_candidate_with_opt_rtc_ice_candidate(Some(&ice_candidate));
        JsFuture::from(promise)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("addIceCandidate failed: {:?}", e)))?;
        Ok(())
    }

    fn set_audio_enabled(&mut self, enabled: bool) {
        self.set_tracks_enabled(self.local_stream.get_audio_tracks(), enabled);
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        self.set_tracks_enabled(self.local_stream.get_video_tracks(), enabled);
    }

    fn poll_event(&mut self) -> Option<MediaEvent> {
        self.shared.lock().events.pop_front()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for track in self.local_stream.get_tracks().iter() {
            let track: web_sys::MediaStreamTrack = track.unchecked_into();
            track.stop();
        }
        self.pc.close();
    }
}

impl Drop for WebMediaSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create an RTCPeerConnection with STUN configuration
fn create_peer_connection() -> std::result::Result<web_sys::RtcPeerConnection, JsValue> {
    let ice_servers = js_sys::Array::new();

    let server = js_sys::Object::new();
    let urls = js_sys::Array::new();
    for stun in STUN_SERVERS {
        urls.push(&JsValue::from_str(stun));
    }
    js_sys::Reflect::set(&server, &"urls".into(), &urls)?;
    ice_servers.push(&server);

    let config = web_sys::RtcConfiguration::new();
    config.set_ice_servers(&ice_servers);

    web_sys::RtcPeerConnection::new_with_configuration(&config)
}
