//! # Call Management
//!
//! The call manager ties the other modules together: it drives one call
//! at a time through the [`session`] state machine, negotiates media via
//! [`negotiator`], speaks to the relay in [`crate::signaling`] types, and
//! writes outcomes through [`crate::history`].
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         CallManager                           │
//! │                                                               │
//! │  UI ops (dial/accept/...) ──┐                                 │
//! │  SignalServerMessage ───────┼──▶ CallSession state machine    │
//! │  expire_ring(now) ──────────┘         │                       │
//! │                                       ▼                       │
//! │                            MediaNegotiator (offer/answer,     │
//! │                                       │     candidates)       │
//! │              ┌────────────────────────┴──────────┐            │
//! │              ▼                                   ▼            │
//! │   SignalClientMessage channel            CallEvent channel    │
//! │        (to the relay)                       (to the UI)       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager owns no sockets and no timers. The host pumps parsed
//! server messages in, drains the two output channels, and calls
//! [`CallManager::expire_ring`] from whatever clock it has. That keeps
//! every lifecycle path testable without a relay or a browser.

pub mod events;
pub mod negotiator;
pub mod session;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use events::{CallEvent, EndReason};
pub use session::{CallRole, CallState};

use crate::error::{Error, Result};
use crate::history::{CallOutcomeRecord, HistoryRecorder, TimelineStore};
use crate::media::{DevicePolicy, MediaBackend};
use crate::signaling::{SignalClientMessage, SignalServerMessage};
use crate::time::now_timestamp;
use negotiator::{MediaNegotiator, NegotiatorOutput};
use session::{CallInput, CallSession};

/// Tunables for call handling.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Seconds an incoming call rings before it is marked missed.
    pub ring_timeout_seconds: i64,
    /// Extra seconds the caller waits past the ring timeout, so the
    /// callee's side always expires first.
    pub caller_grace_seconds: i64,
    pub device_policy: DevicePolicy,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_seconds: 30,
            caller_grace_seconds: 5,
            device_policy: DevicePolicy::default(),
        }
    }
}

/// Everything attached to the one in-flight call attempt.
struct ActiveCall<B: MediaBackend> {
    session: CallSession,
    negotiator: Option<MediaNegotiator<B::Session>>,
    /// The remote offer, held until the user accepts.
    pending_offer: Option<String>,
    /// Remote candidate payloads that arrived before we had a negotiator.
    pending_remote_candidates: Vec<String>,
    /// Local candidate payloads gathered before the remote connection id
    /// was known.
    pending_local_candidates: Vec<String>,
}

/// Client-side orchestrator for two-party calls.
pub struct CallManager<B: MediaBackend, T: TimelineStore> {
    local_user_id: String,
    config: CallConfig,
    backend: B,
    recorder: HistoryRecorder<T>,
    signal_tx: mpsc::UnboundedSender<SignalClientMessage>,
    event_tx: mpsc::UnboundedSender<CallEvent>,
    connection_id: Option<String>,
    online_users: Vec<String>,
    active: Option<ActiveCall<B>>,
}

impl<B: MediaBackend, T: TimelineStore> CallManager<B, T> {
    /// Create a manager plus the receivers for its two output channels.
    pub fn new(
        local_user_id: impl Into<String>,
        config: CallConfig,
        backend: B,
        timeline: T,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<SignalClientMessage>,
        mpsc::UnboundedReceiver<CallEvent>,
    ) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_user_id: local_user_id.into(),
            config,
            backend,
            recorder: HistoryRecorder::new(timeline),
            signal_tx,
            event_tx,
            connection_id: None,
            online_users: Vec::new(),
            active: None,
        };
        (manager, signal_rx, event_rx)
    }

    pub fn is_registered(&self) -> bool {
        self.connection_id.is_some()
    }

    pub fn online_users(&self) -> &[String] {
        &self.online_users
    }

    pub fn call_state(&self) -> CallState {
        self.active
            .as_ref()
            .map(|a| a.session.state)
            .unwrap_or(CallState::Idle)
    }

    // ── UI operations ──────────────────────────────────────────────────────

    /// Announce ourselves to the relay.
    pub fn register(&mut self) -> Result<()> {
        self.send_signal(SignalClientMessage::Register {
            user_id: self.local_user_id.clone(),
        })
    }

    /// Start an outgoing call.
    ///
    /// Capture devices are acquired before anything touches the network;
    /// a device failure aborts the attempt with no trace on the wire and
    /// no history record.
    pub async fn dial(&mut self, remote_user_id: &str) -> Result<()> {
        if !self.is_registered() {
            return Err(Error::NotRegistered);
        }
        if let Some(active) = &self.active {
            return Err(Error::SessionExists(active.session.remote_user_id.clone()));
        }

        let media_session = self.backend.open_session(self.config.device_policy).await?;
        let mut negotiator = MediaNegotiator::new(media_session);
        let offer = negotiator.create_offer().await?;

        let deadline = now_timestamp()
            + self.config.ring_timeout_seconds
            + self.config.caller_grace_seconds;
        let session = CallSession::dialing(self.local_user_id.clone(), remote_user_id, deadline);

        info!(remote_user_id, "Dialing");
        self.send_signal(SignalClientMessage::CallUser {
            to_user_id: remote_user_id.to_string(),
            offer,
        })?;

        self.active = Some(ActiveCall {
            session,
            negotiator: Some(negotiator),
            pending_offer: None,
            pending_remote_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
        });
        self.emit(CallEvent::Dialing {
            remote_user_id: remote_user_id.to_string(),
        });
        Ok(())
    }

    /// Accept the ringing incoming call.
    ///
    /// Devices are acquired here, not when the offer arrived; if capture
    /// or offer negotiation fails the call is rejected and torn down so
    /// the caller is not left hanging.
    pub async fn accept(&mut self) -> Result<()> {
        let active = self.active.as_mut().ok_or_else(|| {
            Error::SessionNotFound("no incoming call".to_string())
        })?;
        if active.session.state != CallState::Ringing {
            return Err(Error::SessionNotFound(format!(
                "no ringing call (state {:?})",
                active.session.state
            )));
        }
        let connection_id = active
            .session
            .remote_connection_id
            .clone()
            .ok_or_else(|| Error::Internal("Ringing call has no connection id".to_string()))?;
        let offer = active
            .pending_offer
            .take()
            .ok_or_else(|| Error::Internal("Ringing call has no stored offer".to_string()))?;
        let pending_candidates = std::mem::take(&mut active.pending_remote_candidates);
        let remote_user_id = active.session.remote_user_id.clone();

        let media_session = match self.backend.open_session(self.config.device_policy).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Capture failed while accepting; rejecting call");
                self.abort_accept(&connection_id);
                return Err(e);
            }
        };

        let mut negotiator = MediaNegotiator::new(media_session);
        let answer = match negotiator.accept_offer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "Offer negotiation failed; rejecting call");
                negotiator.close();
                self.abort_accept(&connection_id);
                return Err(e);
            }
        };
        for candidate in &pending_candidates {
            // A single bad candidate is not fatal; transport events decide
            if let Err(e) = negotiator.handle_remote_candidate(candidate).await {
                warn!(error = %e, "Failed to apply buffered candidate");
            }
        }

        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        active.negotiator = Some(negotiator);
        active.session.apply(CallInput::Accept);

        info!(remote_user_id, "Call accepted");
        self.send_signal(SignalClientMessage::MakeAnswer {
            to_connection_id: connection_id,
            answer,
        })?;
        self.emit(CallEvent::CallConnected { remote_user_id });
        self.pump_media()?;
        Ok(())
    }

    /// Reject the caller and end the failed accept attempt.
    fn abort_accept(&mut self, connection_id: &str) {
        let _ = self.send_signal(SignalClientMessage::RejectCall {
            to_connection_id: connection_id.to_string(),
        });
        self.end_active(CallInput::Reject, EndReason::MediaFailed);
    }

    /// Decline the ringing incoming call.
    pub fn reject(&mut self) -> Result<()> {
        let active = self.active.as_mut().ok_or_else(|| {
            Error::SessionNotFound("no incoming call".to_string())
        })?;
        if active.session.state != CallState::Ringing {
            return Err(Error::SessionNotFound(format!(
                "no ringing call (state {:?})",
                active.session.state
            )));
        }
        if let Some(connection_id) = active.session.remote_connection_id.clone() {
            self.send_signal(SignalClientMessage::RejectCall {
                to_connection_id: connection_id,
            })?;
        }
        self.end_active(CallInput::Reject, EndReason::LocalRejected);
        Ok(())
    }

    /// End the current call (or cancel the current attempt).
    pub fn hang_up(&mut self) -> Result<()> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| Error::SessionNotFound("no active call".to_string()))?;
        if let Some(connection_id) = active.session.remote_connection_id.clone() {
            self.send_signal(SignalClientMessage::EndCall {
                to_connection_id: connection_id,
            })?;
        }
        self.end_active(CallInput::HangUp, EndReason::LocalHangUp);
        Ok(())
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| Error::SessionNotFound("no active call".to_string()))?;
        active.session.muted = muted;
        if let Some(negotiator) = active.negotiator.as_mut() {
            negotiator.set_audio_enabled(!muted);
        }
        self.emit(CallEvent::MuteChanged { muted });
        Ok(())
    }

    pub fn set_video_enabled(&mut self, enabled: bool) -> Result<()> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| Error::SessionNotFound("no active call".to_string()))?;
        active.session.video_enabled = enabled;
        if let Some(negotiator) = active.negotiator.as_mut() {
            negotiator.set_video_enabled(enabled);
        }
        self.emit(CallEvent::VideoChanged { enabled });
        Ok(())
    }

    // ── Timer entry ────────────────────────────────────────────────────────

    /// Expire an unanswered attempt whose deadline has passed. The host
    /// calls this from its clock; calls with a live connection ignore it.
    pub fn expire_ring(&mut self, now: i64) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if !active.session.ring_expired(now) {
            return;
        }
        match active.session.role {
            CallRole::Caller => {
                // Tell the callee to stop ringing before we give up
                if let Some(connection_id) = active.session.remote_connection_id.clone() {
                    let _ = self.send_signal(SignalClientMessage::EndCall {
                        to_connection_id: connection_id,
                    });
                }
                self.end_active(CallInput::RingTimeout, EndReason::Unanswered);
            }
            CallRole::Callee => {
                // The caller's own (longer) deadline cleans up its side
                self.end_active(CallInput::RingTimeout, EndReason::Unanswered);
            }
        }
    }

    // ── Server messages ────────────────────────────────────────────────────

    /// Feed one parsed relay message through the state machine.
    pub async fn handle_server_message(&mut self, message: SignalServerMessage) -> Result<()> {
        match message {
            SignalServerMessage::Registered { user_id: _, connection_id } => {
                info!(connection_id, "Registered with relay");
                self.connection_id = Some(connection_id.clone());
                self.emit(CallEvent::Registered { connection_id });
            }
            SignalServerMessage::OnlineUsers { user_ids } => {
                self.online_users = user_ids.clone();
                self.emit(CallEvent::OnlineUsersChanged { user_ids });
            }
            SignalServerMessage::CallPlaced { to_user_id, to_connection_id } => {
                self.handle_call_placed(&to_user_id, to_connection_id)?;
            }
            SignalServerMessage::IncomingCall {
                from_user_id,
                from_connection_id,
                offer,
            } => {
                self.handle_incoming_call(from_user_id, from_connection_id, offer)?;
            }
            SignalServerMessage::AnswerMade { from_connection_id, answer } => {
                self.handle_answer(&from_connection_id, &answer).await?;
            }
            SignalServerMessage::CallRejected { from_connection_id } => {
                if self.is_current_remote(&from_connection_id) {
                    self.end_active(CallInput::PeerRejected, EndReason::Rejected);
                }
            }
            SignalServerMessage::CandidateReceived { from_connection_id, candidate } => {
                self.handle_remote_candidate(&from_connection_id, candidate)
                    .await?;
            }
            SignalServerMessage::CallEnded { from_connection_id } => {
                if self.is_current_remote(&from_connection_id) {
                    self.end_active(CallInput::PeerEnded, EndReason::RemoteEnded);
                }
            }
            SignalServerMessage::UserUnavailable { user_id } => {
                let dialing_this_user = self
                    .active
                    .as_ref()
                    .map(|a| {
                        a.session.state == CallState::Dialing
                            && a.session.remote_user_id == user_id
                    })
                    .unwrap_or(false);
                if dialing_this_user {
                    self.end_active(CallInput::PeerUnavailable, EndReason::Unavailable);
                }
            }
            SignalServerMessage::OutcomeRecorded { from_connection_id: _, record } => {
                // The author already appended this record to the shared
                // timeline; surface it for rendering only.
                let record = CallOutcomeRecord::from_json(&record)?;
                self.emit(CallEvent::RemoteOutcome { record });
            }
            SignalServerMessage::Pong => {}
            SignalServerMessage::Error { message } => {
                warn!(message, "Relay reported an error");
                self.emit(CallEvent::Error { message });
            }
        }
        Ok(())
    }

    fn handle_call_placed(&mut self, to_user_id: &str, to_connection_id: String) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if active.session.state != CallState::Dialing
            || active.session.remote_user_id != to_user_id
        {
            return Ok(());
        }
        active.session.remote_connection_id = Some(to_connection_id.clone());
        // Candidates gathered before the routing info arrived go out now
        let held = std::mem::take(&mut active.pending_local_candidates);
        for candidate in held {
            self.send_signal(SignalClientMessage::Candidate {
                to_connection_id: to_connection_id.clone(),
                candidate,
            })?;
        }
        Ok(())
    }

    fn handle_incoming_call(
        &mut self,
        from_user_id: String,
        from_connection_id: String,
        offer: String,
    ) -> Result<()> {
        if self.active.is_some() {
            // Busy: decline immediately so the caller is not left ringing
            debug!(from_user_id, "Busy; auto-rejecting incoming call");
            return self.send_signal(SignalClientMessage::RejectCall {
                to_connection_id: from_connection_id,
            });
        }
        let deadline = now_timestamp() + self.config.ring_timeout_seconds;
        let session = CallSession::ringing(
            self.local_user_id.clone(),
            from_user_id.clone(),
            from_connection_id,
            deadline,
        );
        self.active = Some(ActiveCall {
            session,
            negotiator: None,
            pending_offer: Some(offer),
            pending_remote_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
        });
        info!(from_user_id, "Incoming call");
        self.emit(CallEvent::IncomingCall {
            remote_user_id: from_user_id,
        });
        Ok(())
    }

    async fn handle_answer(&mut self, from_connection_id: &str, answer: &str) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if active.session.state != CallState::Dialing {
            return Ok(());
        }
        // First answer wins; an answer may arrive before CallPlaced if the
        // callee picked up instantly, so adopt the connection id from it.
        match &active.session.remote_connection_id {
            Some(known) if known != from_connection_id => return Ok(()),
            Some(_) => {}
            None => active.session.remote_connection_id = Some(from_connection_id.to_string()),
        }
        let Some(negotiator) = active.negotiator.as_mut() else {
            return Ok(());
        };
        if let Err(e) = negotiator.apply_answer(answer).await {
            warn!(error = %e, "Answer negotiation failed; ending call");
            let _ = self.send_signal(SignalClientMessage::EndCall {
                to_connection_id: from_connection_id.to_string(),
            });
            self.end_active(CallInput::HangUp, EndReason::MediaFailed);
            return Err(e);
        }
        active.session.apply(CallInput::AnswerReceived);
        let remote_user_id = active.session.remote_user_id.clone();

        // Flush anything held for the now-confirmed connection id
        let held = std::mem::take(&mut active.pending_local_candidates);
        let connection_id = from_connection_id.to_string();
        for candidate in held {
            self.send_signal(SignalClientMessage::Candidate {
                to_connection_id: connection_id.clone(),
                candidate,
            })?;
        }

        info!(remote_user_id, "Call connected");
        self.emit(CallEvent::CallConnected { remote_user_id });
        self.pump_media()?;
        Ok(())
    }

    async fn handle_remote_candidate(
        &mut self,
        from_connection_id: &str,
        candidate: String,
    ) -> Result<()> {
        if !self.is_current_remote(from_connection_id) {
            return Ok(());
        }
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        match active.negotiator.as_mut() {
            Some(negotiator) => negotiator.handle_remote_candidate(&candidate).await,
            // Ringing and not yet accepted; keep for the negotiator
            None => {
                active.pending_remote_candidates.push(candidate);
                Ok(())
            }
        }
    }

    // ── Media pump ─────────────────────────────────────────────────────────

    /// Drain negotiator output: relay local candidates, react to
    /// transport changes. The host calls this after feeding messages in
    /// and whenever its media layer signals activity.
    pub fn pump_media(&mut self) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let Some(negotiator) = active.negotiator.as_mut() else {
            return Ok(());
        };

        let mut transport_lost = false;
        let mut outgoing = Vec::new();
        for output in negotiator.drain() {
            match output {
                NegotiatorOutput::LocalCandidate(candidate) => {
                    let payload = serde_json::to_string(&candidate)?;
                    outgoing.push((payload, candidate));
                }
                NegotiatorOutput::TransportConnected => {
                    active.session.apply(CallInput::TransportEstablished);
                }
                NegotiatorOutput::TransportLost => transport_lost = true,
                NegotiatorOutput::RemoteTrackEnded => {
                    debug!("Remote track ended");
                }
            }
        }

        let connection_id = active.session.remote_connection_id.clone();
        for (payload, candidate) in outgoing {
            match &connection_id {
                Some(connection_id) => {
                    self.send_signal(SignalClientMessage::Candidate {
                        to_connection_id: connection_id.clone(),
                        candidate: payload,
                    })?;
                    self.emit(CallEvent::CandidateSent { candidate });
                }
                // No routing info yet; hold until CallPlaced or the answer
                None => {
                    if let Some(active) = self.active.as_mut() {
                        active.pending_local_candidates.push(payload);
                    }
                }
            }
        }

        if transport_lost {
            self.end_active(CallInput::TransportLost, EndReason::TransportLost);
        }
        Ok(())
    }

    // ── Teardown ───────────────────────────────────────────────────────────

    /// Run teardown for the active call: close media, write exactly one
    /// outcome record, relay it, emit the end event. Safe to reach twice;
    /// the session's `ended` latch makes the second pass a no-op.
    fn end_active(&mut self, input: CallInput, reason: EndReason) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if active.session.ended {
            return;
        }
        active.session.ended = true;
        active.session.apply(input);

        if let Some(negotiator) = active.negotiator.as_mut() {
            negotiator.close();
        }

        let connected = active.session.connected_at.is_some();
        let duration = active.session.connected_duration(now_timestamp());
        let (sender, receiver) = match active.session.role {
            CallRole::Caller => (
                active.session.local_user_id.clone(),
                active.session.remote_user_id.clone(),
            ),
            CallRole::Callee => (
                active.session.remote_user_id.clone(),
                active.session.local_user_id.clone(),
            ),
        };

        let record = match self
            .recorder
            .record(sender, receiver, active.session.role, connected, duration)
        {
            Ok(record) => {
                // Share our record so both timelines agree
                if let Some(connection_id) = active.session.remote_connection_id.clone() {
                    if let Ok(payload) = record.to_json() {
                        let _ = self.send_signal(SignalClientMessage::RecordOutcome {
                            to_connection_id: connection_id,
                            record: payload,
                        });
                    }
                }
                Some(record)
            }
            Err(e) => {
                warn!(error = %e, "Failed to append call record");
                None
            }
        };

        info!(
            remote_user_id = active.session.remote_user_id,
            ?reason,
            connected,
            duration,
            "Call ended"
        );
        self.emit(CallEvent::CallEnded {
            remote_user_id: active.session.remote_user_id.clone(),
            reason,
            record,
        });
    }

    // ── Plumbing ───────────────────────────────────────────────────────────

    fn is_current_remote(&self, connection_id: &str) -> bool {
        self.active
            .as_ref()
            .and_then(|a| a.session.remote_connection_id.as_deref())
            .map(|known| known == connection_id)
            .unwrap_or(false)
    }

    fn send_signal(&self, message: SignalClientMessage) -> Result<()> {
        self.signal_tx
            .send(message)
            .map_err(|_| Error::ChannelClosed)
    }

    fn emit(&self, event: CallEvent) {
        // The UI dropping its receiver must not break call handling
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::history::OutcomeStatus;
    use crate::media::{
        DeviceKind, IceCandidate, MediaDeviceInfo, MediaEvent, MediaSession, SessionDescription,
    };

    // ── Fakes ──────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeSessionState {
        remote_description: Option<SessionDescription>,
        remote_candidates: Vec<IceCandidate>,
        events: VecDeque<MediaEvent>,
        audio_enabled: bool,
        video_enabled: bool,
        closed: bool,
    }

    struct FakeSession {
        state: Arc<Mutex<FakeSessionState>>,
    }

    #[async_trait(?Send)]
    impl MediaSession for FakeSession {
        async fn create_offer(&mut self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("offer-sdp"))
        }

        async fn create_answer(&mut self) -> Result<SessionDescription> {
            if self.state.lock().remote_description.is_none() {
                return Err(Error::DescriptionNotSet);
            }
            Ok(SessionDescription::answer("answer-sdp"))
        }

        async fn set_remote_description(
            &mut self,
            description: SessionDescription,
        ) -> Result<()> {
            self.state.lock().remote_description = Some(description);
            Ok(())
        }

        async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
            let mut state = self.state.lock();
            if state.remote_description.is_none() {
                return Err(Error::DescriptionNotSet);
            }
            state.remote_candidates.push(candidate);
            Ok(())
        }

        fn set_audio_enabled(&mut self, enabled: bool) {
            self.state.lock().audio_enabled = enabled;
        }

        fn set_video_enabled(&mut self, enabled: bool) {
            self.state.lock().video_enabled = enabled;
        }

        fn poll_event(&mut self) -> Option<MediaEvent> {
            self.state.lock().events.pop_front()
        }

        fn close(&mut self) {
            self.state.lock().closed = true;
        }
    }

    struct FakeBackend {
        fail_with: Option<Error>,
        /// State handle for the most recently opened session.
        last_session: Arc<Mutex<Option<Arc<Mutex<FakeSessionState>>>>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                fail_with: None,
                last_session: Arc::new(Mutex::new(None)),
            }
        }

        fn failing(error: Error) -> Self {
            Self {
                fail_with: Some(error),
                last_session: Arc::new(Mutex::new(None)),
            }
        }

        fn session_state(&self) -> Arc<Mutex<FakeSessionState>> {
            self.last_session.lock().clone().expect("no session opened")
        }
    }

    #[async_trait(?Send)]
    impl MediaBackend for FakeBackend {
        type Session = FakeSession;

        async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
            Ok(vec![
                MediaDeviceInfo {
                    device_id: "mic".to_string(),
                    kind: DeviceKind::AudioInput,
                    label: "Mic".to_string(),
                },
                MediaDeviceInfo {
                    device_id: "cam".to_string(),
                    kind: DeviceKind::VideoInput,
                    label: "Camera".to_string(),
                },
            ])
        }

        async fn open_session(&self, _policy: DevicePolicy) -> Result<FakeSession> {
            if let Some(error) = &self.fail_with {
                return Err(Error::DeviceFailed(error.to_string()));
            }
            let state = Arc::new(Mutex::new(FakeSessionState {
                audio_enabled: true,
                video_enabled: true,
                ..Default::default()
            }));
            *self.last_session.lock() = Some(state.clone());
            Ok(FakeSession { state })
        }
    }

    #[derive(Clone)]
    struct SharedTimeline {
        entries: Arc<Mutex<Vec<CallOutcomeRecord>>>,
    }

    impl SharedTimeline {
        fn new() -> Self {
            Self {
                entries: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn records(&self) -> Vec<CallOutcomeRecord> {
            self.entries.lock().clone()
        }
    }

    impl TimelineStore for SharedTimeline {
        fn append(&mut self, record: &CallOutcomeRecord) -> Result<()> {
            self.entries.lock().push(record.clone());
            Ok(())
        }
    }

    // ── Helpers ────────────────────────────────────────────────────────────

    type TestManager = CallManager<FakeBackend, SharedTimeline>;

    fn registered_manager(
        user_id: &str,
    ) -> (
        TestManager,
        mpsc::UnboundedReceiver<SignalClientMessage>,
        mpsc::UnboundedReceiver<CallEvent>,
        SharedTimeline,
    ) {
        let timeline = SharedTimeline::new();
        let (mut manager, signal_rx, event_rx) = CallManager::new(
            user_id,
            CallConfig::default(),
            FakeBackend::new(),
            timeline.clone(),
        );
        manager.connection_id = Some("local-conn".to_string());
        (manager, signal_rx, event_rx, timeline)
    }

    fn drain_signals(
        rx: &mut mpsc::UnboundedReceiver<SignalClientMessage>,
    ) -> Vec<SignalClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<CallEvent>) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn answer_payload() -> String {
        serde_json::to_string(&SessionDescription::answer("answer-sdp")).unwrap()
    }

    fn offer_payload() -> String {
        serde_json::to_string(&SessionDescription::offer("offer-sdp")).unwrap()
    }

    fn candidate_payload(label: &str) -> String {
        serde_json::to_string(&IceCandidate {
            candidate: label.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        })
        .unwrap()
    }

    // ── Caller lifecycle ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_completed_call_from_the_caller_side() {
        let (mut manager, mut signal_rx, mut event_rx, timeline) =
            registered_manager("patient-42");

        manager.dial("doctor-7").await.unwrap();
        assert_eq!(manager.call_state(), CallState::Dialing);
        let sent = drain_signals(&mut signal_rx);
        assert!(matches!(
            &sent[0],
            SignalClientMessage::CallUser { to_user_id, .. } if to_user_id == "doctor-7"
        ));

        manager
            .handle_server_message(SignalServerMessage::CallPlaced {
                to_user_id: "doctor-7".to_string(),
                to_connection_id: "conn-doctor".to_string(),
            })
            .await
            .unwrap();
        manager
            .handle_server_message(SignalServerMessage::AnswerMade {
                from_connection_id: "conn-doctor".to_string(),
                answer: answer_payload(),
            })
            .await
            .unwrap();
        assert_eq!(manager.call_state(), CallState::Connected);

        manager.hang_up().unwrap();
        assert_eq!(manager.call_state(), CallState::Idle);

        let sent = drain_signals(&mut signal_rx);
        assert!(matches!(&sent[0], SignalClientMessage::EndCall { .. }));
        assert!(matches!(&sent[1], SignalClientMessage::RecordOutcome { .. }));

        let records = timeline.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, OutcomeStatus::Completed);
        assert_eq!(records[0].sender, "patient-42");
        assert_eq!(records[0].receiver, "doctor-7");

        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(e, CallEvent::Dialing { .. })));
        assert!(events.iter().any(|e| matches!(e, CallEvent::CallConnected { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::CallEnded { reason: EndReason::LocalHangUp, .. }
        )));
    }

    #[tokio::test]
    async fn test_dial_requires_registration() {
        let timeline = SharedTimeline::new();
        let (mut manager, _signal_rx, _event_rx) = CallManager::new(
            "patient-42",
            CallConfig::default(),
            FakeBackend::new(),
            timeline,
        );
        let err = manager.dial("doctor-7").await.unwrap_err();
        assert!(matches!(err, Error::NotRegistered));
    }

    #[tokio::test]
    async fn test_device_failure_aborts_dial_before_the_network() {
        let timeline = SharedTimeline::new();
        let (mut manager, mut signal_rx, _event_rx) = CallManager::new(
            "patient-42",
            CallConfig::default(),
            FakeBackend::failing(Error::NoCamera),
            timeline.clone(),
        );
        manager.connection_id = Some("local-conn".to_string());

        let err = manager.dial("doctor-7").await.unwrap_err();
        assert!(matches!(err, Error::DeviceFailed(_)));
        assert_eq!(manager.call_state(), CallState::Idle);
        assert!(drain_signals(&mut signal_rx).is_empty());
        assert!(timeline.records().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_target_records_missed() {
        let (mut manager, mut signal_rx, mut event_rx, timeline) =
            registered_manager("patient-42");

        manager.dial("doctor-7").await.unwrap();
        manager
            .handle_server_message(SignalServerMessage::UserUnavailable {
                user_id: "doctor-7".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(manager.call_state(), CallState::Idle);
        let records = timeline.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, OutcomeStatus::Missed);
        assert_eq!(records[0].duration_seconds, 0);

        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::CallEnded { reason: EndReason::Unavailable, .. }
        )));
        // No EndCall or RecordOutcome: the routing info never existed
        let sent = drain_signals(&mut signal_rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], SignalClientMessage::CallUser { .. }));
    }

    #[tokio::test]
    async fn test_rejected_call_records_missed_for_the_caller() {
        let (mut manager, _signal_rx, mut event_rx, timeline) = registered_manager("patient-42");

        manager.dial("doctor-7").await.unwrap();
        manager
            .handle_server_message(SignalServerMessage::CallPlaced {
                to_user_id: "doctor-7".to_string(),
                to_connection_id: "conn-doctor".to_string(),
            })
            .await
            .unwrap();
        manager
            .handle_server_message(SignalServerMessage::CallRejected {
                from_connection_id: "conn-doctor".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(timeline.records()[0].status, OutcomeStatus::Missed);
        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::CallEnded { reason: EndReason::Rejected, .. }
        )));
    }

    #[tokio::test]
    async fn test_caller_ring_timeout_cancels_and_records() {
        let (mut manager, mut signal_rx, _event_rx, timeline) = registered_manager("patient-42");

        manager.dial("doctor-7").await.unwrap();
        manager
            .handle_server_message(SignalServerMessage::CallPlaced {
                to_user_id: "doctor-7".to_string(),
                to_connection_id: "conn-doctor".to_string(),
            })
            .await
            .unwrap();

        // Before the deadline nothing happens
        manager.expire_ring(now_timestamp());
        assert_eq!(manager.call_state(), CallState::Dialing);

        manager.expire_ring(now_timestamp() + 60);
        assert_eq!(manager.call_state(), CallState::Idle);
        assert_eq!(timeline.records()[0].status, OutcomeStatus::Missed);

        let sent = drain_signals(&mut signal_rx);
        assert!(sent.iter().any(|m| matches!(m, SignalClientMessage::EndCall { .. })));
    }

    // ── Callee lifecycle ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_accepted_call_with_early_candidates() {
        let (mut manager, mut signal_rx, mut event_rx, timeline) =
            registered_manager("doctor-7");

        manager
            .handle_server_message(SignalServerMessage::IncomingCall {
                from_user_id: "patient-42".to_string(),
                from_connection_id: "conn-patient".to_string(),
                offer: offer_payload(),
            })
            .await
            .unwrap();
        assert_eq!(manager.call_state(), CallState::Ringing);

        // Candidates trickle in before the user taps accept
        manager
            .handle_server_message(SignalServerMessage::CandidateReceived {
                from_connection_id: "conn-patient".to_string(),
                candidate: candidate_payload("early-1"),
            })
            .await
            .unwrap();
        manager
            .handle_server_message(SignalServerMessage::CandidateReceived {
                from_connection_id: "conn-patient".to_string(),
                candidate: candidate_payload("early-2"),
            })
            .await
            .unwrap();

        manager.accept().await.unwrap();
        assert_eq!(manager.call_state(), CallState::Connected);

        let session_state = manager.backend.session_state();
        {
            let state = session_state.lock();
            assert!(state.remote_description.is_some());
            let applied: Vec<&str> = state
                .remote_candidates
                .iter()
                .map(|c| c.candidate.as_str())
                .collect();
            assert_eq!(applied, vec!["early-1", "early-2"]);
        }

        let sent = drain_signals(&mut signal_rx);
        assert!(matches!(
            &sent[0],
            SignalClientMessage::MakeAnswer { to_connection_id, .. }
                if to_connection_id == "conn-patient"
        ));

        manager
            .handle_server_message(SignalServerMessage::CallEnded {
                from_connection_id: "conn-patient".to_string(),
            })
            .await
            .unwrap();

        let records = timeline.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, OutcomeStatus::Completed);
        assert_eq!(records[0].sender, "patient-42");
        assert_eq!(records[0].receiver, "doctor-7");
        assert!(session_state.lock().closed);

        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::CallEnded { reason: EndReason::RemoteEnded, .. }
        )));
    }

    #[tokio::test]
    async fn test_unanswered_incoming_call_records_not_answered() {
        let (mut manager, mut signal_rx, _event_rx, timeline) = registered_manager("doctor-7");

        manager
            .handle_server_message(SignalServerMessage::IncomingCall {
                from_user_id: "patient-42".to_string(),
                from_connection_id: "conn-patient".to_string(),
                offer: offer_payload(),
            })
            .await
            .unwrap();

        manager.expire_ring(now_timestamp() + 31);
        assert_eq!(manager.call_state(), CallState::Idle);

        let records = timeline.records();
        assert_eq!(records[0].status, OutcomeStatus::NotAnswered);
        assert_eq!(records[0].sender, "patient-42");
        assert_eq!(records[0].receiver, "doctor-7");

        // The callee shares its record but never cancels the caller
        let sent = drain_signals(&mut signal_rx);
        assert!(!sent.iter().any(|m| matches!(m, SignalClientMessage::EndCall { .. })));
    }

    #[tokio::test]
    async fn test_rejecting_an_incoming_call() {
        let (mut manager, mut signal_rx, _event_rx, timeline) = registered_manager("doctor-7");

        manager
            .handle_server_message(SignalServerMessage::IncomingCall {
                from_user_id: "patient-42".to_string(),
                from_connection_id: "conn-patient".to_string(),
                offer: offer_payload(),
            })
            .await
            .unwrap();
        manager.reject().unwrap();

        let sent = drain_signals(&mut signal_rx);
        assert!(matches!(
            &sent[0],
            SignalClientMessage::RejectCall { to_connection_id }
                if to_connection_id == "conn-patient"
        ));
        assert_eq!(timeline.records()[0].status, OutcomeStatus::NotAnswered);
    }

    #[tokio::test]
    async fn test_busy_line_auto_rejects_second_caller() {
        let (mut manager, mut signal_rx, _event_rx, _timeline) =
            registered_manager("doctor-7");

        manager
            .handle_server_message(SignalServerMessage::IncomingCall {
                from_user_id: "patient-42".to_string(),
                from_connection_id: "conn-patient".to_string(),
                offer: offer_payload(),
            })
            .await
            .unwrap();
        manager
            .handle_server_message(SignalServerMessage::IncomingCall {
                from_user_id: "patient-99".to_string(),
                from_connection_id: "conn-other".to_string(),
                offer: offer_payload(),
            })
            .await
            .unwrap();

        // Still ringing with the first caller
        assert_eq!(manager.call_state(), CallState::Ringing);
        let sent = drain_signals(&mut signal_rx);
        assert!(matches!(
            &sent[0],
            SignalClientMessage::RejectCall { to_connection_id }
                if to_connection_id == "conn-other"
        ));
    }

    #[tokio::test]
    async fn test_capture_failure_on_accept_rejects_the_call() {
        let timeline = SharedTimeline::new();
        let (mut manager, mut signal_rx, mut event_rx) = CallManager::new(
            "doctor-7",
            CallConfig::default(),
            FakeBackend::failing(Error::PermissionDenied("NotAllowedError".to_string())),
            timeline.clone(),
        );
        manager.connection_id = Some("local-conn".to_string());

        manager
            .handle_server_message(SignalServerMessage::IncomingCall {
                from_user_id: "patient-42".to_string(),
                from_connection_id: "conn-patient".to_string(),
                offer: offer_payload(),
            })
            .await
            .unwrap();

        assert!(manager.accept().await.is_err());
        assert_eq!(manager.call_state(), CallState::Idle);

        let sent = drain_signals(&mut signal_rx);
        assert!(matches!(&sent[0], SignalClientMessage::RejectCall { .. }));
        assert_eq!(timeline.records()[0].status, OutcomeStatus::NotAnswered);

        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::CallEnded { reason: EndReason::MediaFailed, .. }
        )));
    }

    #[tokio::test]
    async fn test_malformed_offer_on_accept_ends_the_call() {
        let (mut manager, mut signal_rx, mut event_rx, timeline) = registered_manager("doctor-7");

        manager
            .handle_server_message(SignalServerMessage::IncomingCall {
                from_user_id: "patient-42".to_string(),
                from_connection_id: "conn-patient".to_string(),
                offer: "not json".to_string(),
            })
            .await
            .unwrap();

        assert!(manager.accept().await.is_err());
        assert_eq!(manager.call_state(), CallState::Idle);

        let sent = drain_signals(&mut signal_rx);
        assert!(matches!(
            &sent[0],
            SignalClientMessage::RejectCall { to_connection_id }
                if to_connection_id == "conn-patient"
        ));
        assert_eq!(timeline.records()[0].status, OutcomeStatus::NotAnswered);
        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::CallEnded { reason: EndReason::MediaFailed, .. }
        )));
    }

    #[tokio::test]
    async fn test_malformed_answer_ends_the_call() {
        let (mut manager, mut signal_rx, mut event_rx, timeline) =
            registered_manager("patient-42");

        manager.dial("doctor-7").await.unwrap();
        manager
            .handle_server_message(SignalServerMessage::CallPlaced {
                to_user_id: "doctor-7".to_string(),
                to_connection_id: "conn-doctor".to_string(),
            })
            .await
            .unwrap();
        drain_signals(&mut signal_rx);

        let result = manager
            .handle_server_message(SignalServerMessage::AnswerMade {
                from_connection_id: "conn-doctor".to_string(),
                answer: "not json".to_string(),
            })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.call_state(), CallState::Idle);

        let sent = drain_signals(&mut signal_rx);
        assert!(matches!(
            &sent[0],
            SignalClientMessage::EndCall { to_connection_id }
                if to_connection_id == "conn-doctor"
        ));
        assert_eq!(timeline.records()[0].status, OutcomeStatus::Missed);
        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::CallEnded { reason: EndReason::MediaFailed, .. }
        )));
    }

    // ── Late and duplicate events ──────────────────────────────────────────

    #[tokio::test]
    async fn test_late_events_after_end_are_noops() {
        let (mut manager, _signal_rx, _event_rx, timeline) = registered_manager("patient-42");

        manager.dial("doctor-7").await.unwrap();
        manager
            .handle_server_message(SignalServerMessage::CallPlaced {
                to_user_id: "doctor-7".to_string(),
                to_connection_id: "conn-doctor".to_string(),
            })
            .await
            .unwrap();
        manager.hang_up().unwrap();
        assert_eq!(timeline.records().len(), 1);

        // Stale teardown traffic for the finished attempt
        manager
            .handle_server_message(SignalServerMessage::CallEnded {
                from_connection_id: "conn-doctor".to_string(),
            })
            .await
            .unwrap();
        manager
            .handle_server_message(SignalServerMessage::CallRejected {
                from_connection_id: "conn-doctor".to_string(),
            })
            .await
            .unwrap();
        manager.expire_ring(now_timestamp() + 120);

        assert_eq!(manager.call_state(), CallState::Idle);
        assert_eq!(timeline.records().len(), 1);
    }

    #[tokio::test]
    async fn test_second_dial_while_busy_fails() {
        let (mut manager, _signal_rx, _event_rx, _timeline) = registered_manager("patient-42");
        manager.dial("doctor-7").await.unwrap();
        let err = manager.dial("doctor-8").await.unwrap_err();
        assert!(matches!(err, Error::SessionExists(user) if user == "doctor-7"));
    }

    // ── Candidates and media pump ──────────────────────────────────────────

    #[tokio::test]
    async fn test_local_candidates_held_until_routing_is_known() {
        let (mut manager, mut signal_rx, _event_rx, _timeline) =
            registered_manager("patient-42");

        manager.dial("doctor-7").await.unwrap();
        drain_signals(&mut signal_rx);

        // Candidate discovered before CallPlaced arrives
        manager
            .backend
            .session_state()
            .lock()
            .events
            .push_back(MediaEvent::LocalCandidate {
                generation: 0,
                candidate: IceCandidate {
                    candidate: "host-candidate".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                },
            });
        manager.pump_media().unwrap();
        assert!(drain_signals(&mut signal_rx).is_empty());

        manager
            .handle_server_message(SignalServerMessage::CallPlaced {
                to_user_id: "doctor-7".to_string(),
                to_connection_id: "conn-doctor".to_string(),
            })
            .await
            .unwrap();

        let sent = drain_signals(&mut signal_rx);
        assert!(matches!(
            &sent[0],
            SignalClientMessage::Candidate { to_connection_id, candidate }
                if to_connection_id == "conn-doctor" && candidate.contains("host-candidate")
        ));
    }

    #[tokio::test]
    async fn test_transport_loss_ends_the_call() {
        let (mut manager, _signal_rx, mut event_rx, timeline) = registered_manager("patient-42");

        manager.dial("doctor-7").await.unwrap();
        manager
            .handle_server_message(SignalServerMessage::CallPlaced {
                to_user_id: "doctor-7".to_string(),
                to_connection_id: "conn-doctor".to_string(),
            })
            .await
            .unwrap();
        manager
            .handle_server_message(SignalServerMessage::AnswerMade {
                from_connection_id: "conn-doctor".to_string(),
                answer: answer_payload(),
            })
            .await
            .unwrap();

        manager
            .backend
            .session_state()
            .lock()
            .events
            .push_back(MediaEvent::TransportFailed);
        manager.pump_media().unwrap();

        assert_eq!(manager.call_state(), CallState::Idle);
        assert_eq!(timeline.records()[0].status, OutcomeStatus::Completed);
        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::CallEnded { reason: EndReason::TransportLost, .. }
        )));
    }

    #[tokio::test]
    async fn test_mute_and_video_toggles_reach_media_and_ui() {
        let (mut manager, _signal_rx, mut event_rx, _timeline) =
            registered_manager("patient-42");

        manager.dial("doctor-7").await.unwrap();
        manager.set_muted(true).unwrap();
        manager.set_video_enabled(false).unwrap();

        let state = manager.backend.session_state();
        assert!(!state.lock().audio_enabled);
        assert!(!state.lock().video_enabled);

        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(e, CallEvent::MuteChanged { muted: true })));
        assert!(events.iter().any(|e| matches!(e, CallEvent::VideoChanged { enabled: false })));
    }

    #[tokio::test]
    async fn test_remote_outcome_is_surfaced_without_reappending() {
        let (mut manager, _signal_rx, mut event_rx, timeline) = registered_manager("doctor-7");

        let remote = CallOutcomeRecord::new(
            "patient-42",
            "doctor-7",
            OutcomeStatus::Completed,
            60,
        );
        manager
            .handle_server_message(SignalServerMessage::OutcomeRecorded {
                from_connection_id: "conn-patient".to_string(),
                record: remote.to_json().unwrap(),
            })
            .await
            .unwrap();

        // The author's append already reached the shared timeline
        assert!(timeline.records().is_empty());
        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::RemoteOutcome { record } if record == &remote
        )));
    }

    #[tokio::test]
    async fn test_registration_flow() {
        let timeline = SharedTimeline::new();
        let (mut manager, mut signal_rx, mut event_rx) = CallManager::new(
            "patient-42",
            CallConfig::default(),
            FakeBackend::new(),
            timeline,
        );

        manager.register().unwrap();
        let sent = drain_signals(&mut signal_rx);
        assert!(matches!(
            &sent[0],
            SignalClientMessage::Register { user_id } if user_id == "patient-42"
        ));

        manager
            .handle_server_message(SignalServerMessage::Registered {
                user_id: "patient-42".to_string(),
                connection_id: "conn-1".to_string(),
            })
            .await
            .unwrap();
        assert!(manager.is_registered());

        manager
            .handle_server_message(SignalServerMessage::OnlineUsers {
                user_ids: vec!["patient-42".to_string(), "doctor-7".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(manager.online_users().len(), 2);

        let events = drain_events(&mut event_rx);
        assert!(events.iter().any(|e| matches!(e, CallEvent::Registered { .. })));
        assert!(events.iter().any(|e| matches!(e, CallEvent::OnlineUsersChanged { .. })));
    }
}
