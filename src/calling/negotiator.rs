//! Session negotiator: owns the media-transport connection for one call and
//! sequences offer/answer, candidate exchange and track attachment on it.

use std::sync::Arc;

use super::candidates::CandidateBuffer;
use super::error::{CallError, MediaError};
use super::media::{LocalMedia, MediaStream, MediaTrack, Viewport};
use super::signaling::{
    CallEvent, CallKey, CallMessage, IceCandidateInit, SessionDescription, SignalingGateway,
};
use super::transport::{
    ConnectionFactory, EventSink, PeerConnection, RtcConfiguration, SubscriptionId,
};
use super::{CallRole, MediaMode};

pub struct SessionNegotiator {
    key: CallKey,
    role: CallRole,
    factory: Arc<dyn ConnectionFactory>,
    rtc_config: Option<RtcConfiguration>,
    signaling: Arc<dyn SignalingGateway>,
    events: EventSink,
    connection: Option<Arc<dyn PeerConnection>>,
    subscription: Option<SubscriptionId>,
    candidates: CandidateBuffer,
    local_attached: bool,
    closed: bool,
    remote_view: Viewport,
}

impl SessionNegotiator {
    pub fn new(
        key: CallKey,
        role: CallRole,
        factory: Arc<dyn ConnectionFactory>,
        rtc_config: Option<RtcConfiguration>,
        signaling: Arc<dyn SignalingGateway>,
        events: EventSink,
    ) -> Self {
        Self {
            key,
            role,
            factory,
            rtc_config,
            signaling,
            events,
            connection: None,
            subscription: None,
            candidates: CandidateBuffer::new(),
            local_attached: false,
            closed: false,
            remote_view: Viewport::default(),
        }
    }

    /// Remote description applied and (callee) answer sent.
    pub fn initial_negotiation_complete(&self) -> bool {
        self.candidates.is_open()
    }

    /// Offers may go out from the side that placed the call, or from either
    /// side once the first exchange finished (renegotiation). A callee that
    /// offered earlier would race the answer it is about to send.
    pub fn can_send_offer(&self) -> bool {
        self.role == CallRole::Caller || self.initial_negotiation_complete()
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.pending()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The open connection, if one was created and not yet closed.
    pub fn connection(&self) -> Option<&Arc<dyn PeerConnection>> {
        if self.closed {
            return None;
        }
        self.connection.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_view.stream()
    }

    /// Whether the peer's video is actually showing.
    pub fn remote_live(&self) -> bool {
        self.remote_view
            .stream()
            .and_then(|s| s.first_video())
            .is_some_and(|t| t.is_live())
    }

    /// Return the connection, creating it and subscribing to its events on
    /// first use.
    pub fn ensure_connection(&mut self) -> Result<Arc<dyn PeerConnection>, CallError> {
        if self.closed {
            return Err(CallError::Closed);
        }
        if let Some(conn) = &self.connection {
            return Ok(conn.clone());
        }

        let conn = self.factory.create(self.rtc_config.as_ref())?;
        let sub = conn.subscribe(self.events.clone());
        tracing::info!(
            "Created connection for {} ({} ICE server(s), {})",
            self.key,
            self.rtc_config
                .as_ref()
                .map(|c| c.ice_servers.len())
                .unwrap_or(0),
            sub
        );
        self.connection = Some(conn.clone());
        self.subscription = Some(sub);
        Ok(conn)
    }

    /// Attach every local track to the connection, then drop the audio-only
    /// placeholder from the local set (its sender stays reserved).
    pub fn attach_local(&mut self, local: &mut LocalMedia) -> Result<(), CallError> {
        let conn = self.ensure_connection()?;
        let stream = local
            .stream()
            .cloned()
            .ok_or_else(|| MediaError::Other("no local media to attach".into()))?;

        for track in stream.tracks() {
            conn.add_track(track.clone(), &stream)?;
            tracing::debug!("Attached local {} track {}", track.kind().as_str(), track.id());
        }
        self.local_attached = true;
        local.drop_placeholder();
        Ok(())
    }

    /// Handle negotiation-needed. Returns true if an offer was sent.
    pub async fn on_negotiation_needed(&mut self) -> Result<bool, CallError> {
        if !self.can_send_offer() {
            tracing::debug!(
                "Negotiation needed on {} before the first answer went out; not offering",
                self.key
            );
            return Ok(false);
        }
        let Some(conn) = self.connection().cloned() else {
            return Ok(false);
        };

        let offer = conn.create_offer().await?;
        conn.set_local_description(offer.clone()).await?;
        let desc = conn.local_description().unwrap_or(offer);
        self.emit(CallEvent::Offer(desc)).await?;
        tracing::info!("Sent offer for {}", self.key);
        Ok(true)
    }

    /// Answer an inbound offer.
    ///
    /// The remote description is applied first; local media is acquired and
    /// attached before the answer is created so the answer covers the tracks
    /// we will send. Renegotiation offers skip acquisition and attachment.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
        local: &mut LocalMedia,
        mode: MediaMode,
    ) -> Result<(), CallError> {
        let conn = self.ensure_connection()?;
        conn.set_remote_description(offer).await?;
        tracing::debug!("Remote offer applied for {}", self.key);

        if !self.local_attached {
            if !local.has_media() {
                local.acquire(mode).await?;
            }
            self.attach_local(local)?;
        }

        let answer = conn.create_answer().await?;
        conn.set_local_description(answer.clone()).await?;
        let desc = conn.local_description().unwrap_or(answer);
        self.emit(CallEvent::Answer(desc)).await?;
        tracing::info!("Sent answer for {}", self.key);

        self.complete_initial_negotiation().await;
        Ok(())
    }

    /// Apply the peer's answer to our offer.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        let Some(conn) = self.connection().cloned() else {
            return Err(CallError::PeerProtocol(
                "answer received without an outstanding offer".into(),
            ));
        };
        conn.set_remote_description(answer).await?;
        tracing::info!("Remote answer applied for {}", self.key);
        self.complete_initial_negotiation().await;
        Ok(())
    }

    /// Mark the initial negotiation complete and apply buffered candidates in
    /// arrival order. Only the first call does anything.
    async fn complete_initial_negotiation(&mut self) {
        if self.candidates.is_open() {
            return;
        }
        let queued = self.candidates.drain();
        tracing::info!(
            "Initial negotiation complete for {}; applying {} buffered candidate(s)",
            self.key,
            queued.len()
        );
        let Some(conn) = self.connection().cloned() else {
            return;
        };
        for candidate in queued {
            if let Err(e) = conn.add_ice_candidate(candidate).await {
                tracing::warn!("Buffered remote candidate rejected: {}", e);
            }
        }
    }

    /// Apply a remote candidate now, or hold it until the initial
    /// negotiation completes.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidateInit,
    ) -> Result<(), CallError> {
        let Some(candidate) = self.candidates.offer(candidate) else {
            return Ok(());
        };
        let conn = self.connection().cloned().ok_or(CallError::Closed)?;
        conn.add_ice_candidate(candidate)
            .await
            .map_err(|e| CallError::Candidate(e.to_string()))
    }

    /// Forward a locally gathered candidate to the peer.
    pub async fn send_local_candidate(&self, candidate: Option<IceCandidateInit>) {
        let Some(candidate) = candidate else {
            tracing::debug!("Local candidate gathering finished for {}", self.key);
            return;
        };
        tracing::trace!("Local candidate: {}", candidate.candidate);
        if let Err(e) = self.emit(CallEvent::IceCandidate(candidate)).await {
            tracing::warn!("Failed to send local candidate: {}", e);
        }
    }

    /// Show an arriving remote stream.
    pub fn on_remote_track(&mut self, track: Arc<dyn MediaTrack>, stream: MediaStream) {
        tracing::info!(
            "Remote {} track {} arrived (stream {})",
            track.kind().as_str(),
            track.id(),
            stream.id()
        );
        self.remote_view.attach(stream);
    }

    /// Unsubscribe from the connection, close it, and stop remote tracks.
    /// Returns false if teardown already ran.
    pub fn teardown(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Some(conn) = self.connection.take() {
            if let Some(sub) = self.subscription.take() {
                conn.unsubscribe(sub);
            }
            conn.close();
            tracing::info!("Connection for {} closed", self.key);
        }
        self.remote_view.stop_tracks();
        true
    }

    async fn emit(&self, event: CallEvent) -> Result<(), CallError> {
        tracing::debug!("-> {} {}", event.name(), self.key);
        self.signaling
            .send(CallMessage::new(self.key.clone(), event))
            .await
            .map_err(CallError::from)
    }
}
