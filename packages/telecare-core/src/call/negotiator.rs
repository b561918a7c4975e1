//! Offer/answer negotiation over a media session.
//!
//! The negotiator owns one [`MediaSession`] and enforces the two ordering
//! rules the platform APIs care about:
//!
//! * remote candidates must not reach the session before the remote
//!   description; early arrivals are buffered and flushed in arrival
//!   order once the description lands
//! * local candidates are released strictly in generation order, even if
//!   the platform delivers its callbacks out of turn
//!
//! Descriptions and candidates cross the wire as JSON strings; the
//! negotiator is the only place they are parsed or serialized.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::media::{IceCandidate, MediaEvent, MediaSession, SessionDescription};

/// What the negotiator hands back after draining its session.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorOutput {
    /// A local candidate ready to relay, in generation order.
    LocalCandidate(IceCandidate),
    /// Media transport established end to end.
    TransportConnected,
    /// Media transport dropped or failed.
    TransportLost,
    /// The remote side stopped sending a track.
    RemoteTrackEnded,
}

/// Drives offer/answer and candidate exchange for one call.
pub struct MediaNegotiator<S: MediaSession> {
    session: S,
    remote_description_set: bool,
    /// Remote candidates that arrived before the remote description.
    pending_remote: Vec<IceCandidate>,
    /// Next local candidate generation to release.
    next_generation: u64,
    /// Out-of-order local candidates held until their turn.
    held_local: BTreeMap<u64, IceCandidate>,
}

impl<S: MediaSession> MediaNegotiator<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            remote_description_set: false,
            pending_remote: Vec::new(),
            next_generation: 0,
            held_local: BTreeMap::new(),
        }
    }

    /// Produce the local offer as a wire payload.
    pub async fn create_offer(&mut self) -> Result<String> {
        let offer = self.session.create_offer().await?;
        serde_json::to_string(&offer).map_err(Error::from)
    }

    /// Apply a remote offer and produce the answer payload.
    pub async fn accept_offer(&mut self, offer_json: &str) -> Result<String> {
        let offer: SessionDescription = serde_json::from_str(offer_json)?;
        self.apply_remote_description(offer).await?;
        let answer = self.session.create_answer().await?;
        serde_json::to_string(&answer).map_err(Error::from)
    }

    /// Apply the remote answer to our outstanding offer.
    pub async fn apply_answer(&mut self, answer_json: &str) -> Result<()> {
        let answer: SessionDescription = serde_json::from_str(answer_json)?;
        self.apply_remote_description(answer).await
    }

    async fn apply_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        self.session.set_remote_description(description).await?;
        self.remote_description_set = true;

        // Flush candidates that arrived early, in arrival order
        let pending = std::mem::take(&mut self.pending_remote);
        if !pending.is_empty() {
            debug!(count = pending.len(), "Flushing buffered remote candidates");
        }
        for candidate in pending {
            self.session.add_remote_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Handle a remote candidate payload, buffering it if the remote
    /// description has not been applied yet.
    pub async fn handle_remote_candidate(&mut self, candidate_json: &str) -> Result<()> {
        let candidate: IceCandidate = serde_json::from_str(candidate_json)?;
        if self.remote_description_set {
            self.session.add_remote_candidate(candidate).await
        } else {
            self.pending_remote.push(candidate);
            Ok(())
        }
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.session.set_audio_enabled(enabled);
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.session.set_video_enabled(enabled);
    }

    /// Drain session events, releasing local candidates in generation
    /// order and passing transport events through.
    pub fn drain(&mut self) -> Vec<NegotiatorOutput> {
        let mut out = Vec::new();
        while let Some(event) = self.session.poll_event() {
            match event {
                MediaEvent::LocalCandidate { generation, candidate } => {
                    self.held_local.insert(generation, candidate);
                }
                MediaEvent::TransportConnected => out.push(NegotiatorOutput::TransportConnected),
                MediaEvent::TransportDisconnected | MediaEvent::TransportFailed => {
                    out.push(NegotiatorOutput::TransportLost)
                }
                MediaEvent::RemoteTrackEnded => out.push(NegotiatorOutput::RemoteTrackEnded),
            }
        }
        // Release the contiguous run starting at next_generation
        while let Some(candidate) = self.held_local.remove(&self.next_generation) {
            self.next_generation += 1;
            out.push(NegotiatorOutput::LocalCandidate(candidate));
        }
        out
    }

    /// Tear down the underlying session. Idempotent.
    pub fn close(&mut self) {
        self.session.close();
    }
}
