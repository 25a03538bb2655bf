//! Call state machine: the controller for a single call.
//!
//! A `CallSession` interprets inbound signaling, user actions and connection
//! events, drives local media and the negotiator, and publishes a
//! [`CallSnapshot`] after every observable change. All handlers take
//! `&mut self`, so they run one at a time; [`CallSession::run`] feeds them
//! from the three input channels in a single task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use super::cues::CallCues;
use super::error::CallError;
use super::media::{LocalMedia, MediaDevices};
use super::negotiator::SessionNegotiator;
use super::placeholder::PlaceholderConfig;
use super::signaling::{
    CallEvent, CallKey, CallMessage, InboundSignal, SessionDescription, SignalingGateway,
};
use super::transport::{
    ConnectionEvent, ConnectionFactory, IceConnectionState, RtcConfiguration, SignalingState,
};
use super::{CallPhase, CallRole, CallSnapshot, MediaMode};

/// Delay between a peer hanging up an unanswered call and closing it, so the
/// ended cue is heard.
pub const DEFAULT_REMOTE_HANGUP_DELAY: Duration = Duration::from_secs(2);

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Sink for user-facing notices (banners, toasts).
pub trait CallReporter: Send + Sync {
    fn report(&self, level: NoticeLevel, message: &str);
}

/// Reporter for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl CallReporter for LogReporter {
    fn report(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info => tracing::info!("[notice] {}", message),
            NoticeLevel::Error => tracing::error!("[notice] {}", message),
        }
    }
}

/// User actions, for driving a session through [`CallSession::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    Start,
    AcceptIncoming,
    HangUp,
    ToggleCamera,
    ToggleMic,
}

/// Capabilities a session is built from.
#[derive(Clone)]
pub struct CallDeps {
    pub connections: Arc<dyn ConnectionFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn SignalingGateway>,
    pub cues: Arc<dyn CallCues>,
    pub reporter: Arc<dyn CallReporter>,
}

/// Per-call parameters.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub key: CallKey,
    pub role: CallRole,
    pub media_mode: MediaMode,
    pub rtc_config: Option<RtcConfiguration>,
    pub remote_hangup_delay: Duration,
    pub placeholder: PlaceholderConfig,
}

impl CallOptions {
    pub fn new(key: CallKey, role: CallRole, media_mode: MediaMode) -> Self {
        Self {
            key,
            role,
            media_mode,
            rtc_config: None,
            remote_hangup_delay: DEFAULT_REMOTE_HANGUP_DELAY,
            placeholder: PlaceholderConfig::default(),
        }
    }
}

pub struct CallSession {
    key: CallKey,
    role: CallRole,
    media_mode: MediaMode,
    phase: CallPhase,
    /// Peer hung up while we were still dialing.
    peer_left_early: bool,
    accepted: bool,
    local: LocalMedia,
    negotiator: SessionNegotiator,
    signaling: Arc<dyn SignalingGateway>,
    cues: Arc<dyn CallCues>,
    reporter: Arc<dyn CallReporter>,
    remote_hangup_delay: Duration,
    connected_at: Option<DateTime<Utc>>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    events_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

impl CallSession {
    pub fn new(options: CallOptions, deps: CallDeps) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let negotiator = SessionNegotiator::new(
            options.key.clone(),
            options.role,
            deps.connections,
            options.rtc_config,
            deps.signaling.clone(),
            events_tx,
        );
        let (snapshot_tx, _) =
            watch::channel(CallSnapshot::new(options.role, options.media_mode));

        Self {
            key: options.key,
            role: options.role,
            media_mode: options.media_mode,
            phase: CallPhase::Idle,
            peer_left_early: false,
            accepted: false,
            local: LocalMedia::new(deps.devices, options.placeholder),
            negotiator,
            signaling: deps.signaling,
            cues: deps.cues,
            reporter: deps.reporter,
            remote_hangup_delay: options.remote_hangup_delay,
            connected_at: None,
            snapshot_tx,
            events_rx: Some(events_rx),
        }
    }

    pub fn key(&self) -> &CallKey {
        &self.key
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn negotiator(&self) -> &SessionNegotiator {
        &self.negotiator
    }

    pub fn local_media(&self) -> &LocalMedia {
        &self.local
    }

    /// Subscribe to snapshots. The receiver sees the latest state after
    /// every change.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            role: self.role,
            media_mode: self.media_mode,
            phase: self.phase,
            waiting_for_peer: self.phase == CallPhase::Dialing && !self.peer_left_early,
            audio_enabled: self.local.audio_enabled(),
            video_enabled: self.local.video_live(),
            remote_live: self.negotiator.remote_live(),
            video_toggle_in_progress: self.local.toggle_in_progress(),
            local_stream_id: self.local.preview().stream().map(|s| s.id().to_string()),
            remote_stream_id: self.negotiator.remote_stream().map(|s| s.id().to_string()),
            connected_at: self.connected_at,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn transition(&mut self, next: CallPhase) {
        if self.phase == next {
            return;
        }
        if !self.phase.can_transition_to(next) {
            tracing::warn!(
                "Call {}: ignoring transition {:?} -> {:?}",
                self.key,
                self.phase,
                next
            );
            return;
        }
        tracing::info!("Call {}: {:?} -> {:?}", self.key, self.phase, next);
        self.phase = next;
        if next == CallPhase::Connected {
            self.connected_at = Some(Utc::now());
        }
        self.publish();
    }

    /// Place the outgoing call: capture media, play the dialing cue and send
    /// the invitation. On a callee session this accepts the incoming call.
    pub async fn start(&mut self) -> Result<(), CallError> {
        if self.phase.is_closed() {
            return Err(CallError::Closed);
        }
        if self.local.has_media() {
            let err = CallError::AlreadyInCall;
            self.reporter.report(NoticeLevel::Info, &err.to_string());
            return Err(err);
        }
        if self.role == CallRole::Callee {
            return self.accept_incoming().await;
        }

        if let Err(e) = self.local.acquire(self.media_mode).await {
            let err = CallError::from(e);
            self.fail(err.clone()).await;
            return Err(err);
        }
        self.transition(CallPhase::Dialing);
        self.cues.play_dialing();

        let invite = CallEvent::Invite {
            media_mode: self.media_mode,
        };
        if let Err(err) = self.send(invite).await {
            self.fail(err.clone()).await;
            return Err(err);
        }
        Ok(())
    }

    /// Tell the caller we picked up. Media is captured once their offer
    /// arrives.
    pub async fn accept_incoming(&mut self) -> Result<(), CallError> {
        if self.phase.is_closed() {
            return Err(CallError::Closed);
        }
        if self.role != CallRole::Callee {
            tracing::warn!("Call {}: accept on an outgoing call ignored", self.key);
            return Ok(());
        }
        if self.accepted {
            let err = CallError::AlreadyInCall;
            self.reporter.report(NoticeLevel::Info, &err.to_string());
            return Err(err);
        }
        self.accepted = true;
        self.cues.stop();
        if let Err(err) = self.send(CallEvent::Accept).await {
            self.fail(err.clone()).await;
            return Err(err);
        }
        tracing::info!("Call {}: accepted", self.key);
        Ok(())
    }

    /// End the call. Local resources are released before the peer is
    /// notified; a second call does nothing.
    pub async fn hang_up(&mut self) {
        if self.phase.is_closed() {
            return;
        }
        self.teardown();
        if let Err(e) = self.send(CallEvent::HangUp).await {
            tracing::warn!("Call {}: hang-up notification not sent: {}", self.key, e);
        }
    }

    fn teardown(&mut self) {
        self.cues.stop();
        self.negotiator.teardown();
        self.local.release();
        self.transition(CallPhase::Closed);
    }

    /// Switch the camera off if it is on, on otherwise. Overlapping toggles
    /// are dropped.
    pub async fn toggle_camera(&mut self) -> Result<(), CallError> {
        if self.phase.is_closed() {
            return Err(CallError::Closed);
        }
        if !self.local.has_media() {
            return Ok(());
        }
        if !self.local.begin_toggle() {
            tracing::debug!("Call {}: camera toggle already in progress", self.key);
            return Ok(());
        }
        self.publish();

        let result = if self.local.video_live() {
            self.local.mute_video();
            Ok(())
        } else {
            let conn = self.negotiator.connection().cloned();
            self.local.unmute_video(conn.as_ref()).await
        };
        self.local.end_toggle();

        match result {
            Ok(()) => {
                self.publish();
                Ok(())
            }
            Err(err) => {
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    pub fn toggle_mic(&mut self) {
        if self.phase.is_closed() {
            return;
        }
        if self.local.toggle_mic().is_some() {
            self.publish();
        }
    }

    /// Entry point for everything the messaging channel delivers.
    pub async fn on_inbound(&mut self, signal: InboundSignal) {
        match signal {
            InboundSignal::Message(msg) => self.on_signal(msg).await,
            InboundSignal::Malformed { key, reason } => {
                if key != self.key || self.phase.is_closed() {
                    return;
                }
                self.fail(CallError::PeerProtocol(reason)).await;
            }
        }
    }

    /// Handle one call-control message from the peer.
    pub async fn on_signal(&mut self, msg: CallMessage) {
        if msg.key != self.key {
            tracing::debug!("Ignoring {} for other call {}", msg.event.name(), msg.key);
            return;
        }
        if self.phase.is_closed() {
            tracing::debug!("Ignoring {} for closed call {}", msg.event.name(), self.key);
            return;
        }
        tracing::debug!("<- {} {}", msg.event.name(), self.key);

        match msg.event {
            CallEvent::Accept => self.on_peer_accepted().await,
            CallEvent::Offer(desc) => self.on_offer(desc).await,
            CallEvent::Answer(desc) => self.on_answer(desc).await,
            CallEvent::IceCandidate(candidate) => {
                if let Err(e) = self.negotiator.add_remote_candidate(candidate).await {
                    tracing::warn!("Call {}: remote candidate not applied: {}", self.key, e);
                }
            }
            CallEvent::HangUp => self.on_remote_hang_up().await,
            CallEvent::Ringing => {
                if self.phase == CallPhase::Dialing {
                    self.cues.play_ringing();
                }
            }
            CallEvent::Invite { .. } => {
                tracing::warn!("Call {}: unexpected invite on a live call", self.key);
            }
        }
    }

    async fn on_peer_accepted(&mut self) {
        if self.role != CallRole::Caller || self.phase != CallPhase::Dialing {
            tracing::warn!("Call {}: unexpected accept in {:?}", self.key, self.phase);
            return;
        }
        self.cues.stop();
        self.transition(CallPhase::Negotiating);
        if let Err(e) = self.negotiator.attach_local(&mut self.local) {
            self.fail(e).await;
            return;
        }
        self.publish();
    }

    async fn on_offer(&mut self, offer: SessionDescription) {
        if matches!(self.phase, CallPhase::Idle | CallPhase::Dialing) {
            self.transition(CallPhase::Negotiating);
        }
        match self
            .negotiator
            .accept_offer(offer, &mut self.local, self.media_mode)
            .await
        {
            Ok(()) => {
                self.transition(CallPhase::Connected);
                self.publish();
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        match self.negotiator.accept_answer(answer).await {
            Ok(()) => {
                if self.phase == CallPhase::Negotiating {
                    self.transition(CallPhase::Connected);
                }
            }
            Err(e) => {
                tracing::error!("Call {}: answer rejected: {}", self.key, e);
                self.reporter.report(NoticeLevel::Error, &e.to_string());
            }
        }
    }

    async fn on_remote_hang_up(&mut self) {
        if self.phase == CallPhase::Dialing && !self.peer_left_early {
            tracing::info!("Call {}: peer hung up before answering", self.key);
            self.peer_left_early = true;
            self.publish();
            self.cues.stop();
            self.cues.play_ended();
            if !self.remote_hangup_delay.is_zero() {
                tokio::time::sleep(self.remote_hangup_delay).await;
            }
        } else {
            tracing::info!("Call {}: peer hung up", self.key);
        }
        self.hang_up().await;
    }

    /// Handle one event from the connection.
    pub async fn on_connection_event(&mut self, event: ConnectionEvent) {
        if self.phase.is_closed() {
            tracing::trace!("Dropping connection event for closed call {}", self.key);
            return;
        }
        match event {
            ConnectionEvent::NegotiationNeeded => {
                if let Err(e) = self.negotiator.on_negotiation_needed().await {
                    self.fail(e).await;
                }
            }
            ConnectionEvent::LocalCandidate(candidate) => {
                self.negotiator.send_local_candidate(candidate).await;
            }
            ConnectionEvent::CandidateError { url, code, text } => {
                tracing::warn!("ICE candidate error from {} ({}): {}", url, code, text);
            }
            ConnectionEvent::IceConnectionStateChange(state) => {
                tracing::debug!("Call {}: ICE connection {:?}", self.key, state);
                if matches!(
                    state,
                    IceConnectionState::Failed | IceConnectionState::Closed
                ) {
                    tracing::warn!("Call {}: transport {:?}, hanging up", self.key, state);
                    self.hang_up().await;
                }
            }
            ConnectionEvent::IceGatheringStateChange(state) => {
                tracing::debug!("Call {}: ICE gathering {:?}", self.key, state);
            }
            ConnectionEvent::SignalingStateChange(state) => {
                tracing::debug!("Call {}: signaling {:?}", self.key, state);
                if state == SignalingState::Closed {
                    tracing::warn!("Call {}: signaling closed, hanging up", self.key);
                    self.hang_up().await;
                }
            }
            ConnectionEvent::Track { track, stream } => {
                self.negotiator.on_remote_track(track, stream);
                self.publish();
            }
            ConnectionEvent::RemoteTrackChanged { track_id, change } => {
                tracing::debug!("Remote track {} {:?}", track_id, change);
                self.publish();
            }
        }
    }

    /// Handle every connection event queued so far. Returns how many ran.
    pub async fn process_pending_events(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let Some(rx) = self.events_rx.as_mut() else {
                break;
            };
            let Ok(event) = rx.try_recv() else {
                break;
            };
            self.on_connection_event(event).await;
            handled += 1;
        }
        handled
    }

    pub async fn dispatch(&mut self, command: CallCommand) {
        let result = match command {
            CallCommand::Start => self.start().await,
            CallCommand::AcceptIncoming => self.accept_incoming().await,
            CallCommand::HangUp => {
                self.hang_up().await;
                Ok(())
            }
            CallCommand::ToggleCamera => self.toggle_camera().await,
            CallCommand::ToggleMic => {
                self.toggle_mic();
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::debug!("Call {}: {:?} rejected: {}", self.key, command, e);
        }
    }

    /// Drive the session until it closes. Dropping the command sender hangs
    /// up. Returns the final snapshot.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        mut signals: mpsc::UnboundedReceiver<InboundSignal>,
    ) -> CallSnapshot {
        let Some(mut events) = self.events_rx.take() else {
            self.hang_up().await;
            return self.snapshot();
        };
        let mut signals_open = true;

        while !self.phase.is_closed() {
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.on_connection_event(event).await,
                command = commands.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => {
                        tracing::info!("Call {}: controller gone, hanging up", self.key);
                        self.hang_up().await;
                    }
                },
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => self.on_inbound(signal).await,
                    None => signals_open = false,
                },
            }
        }
        self.snapshot()
    }

    /// Report `err` (unless the user declined device access) and end the
    /// call.
    async fn fail(&mut self, err: CallError) {
        if err.is_silent() {
            tracing::info!("Call {}: media access declined, cancelling", self.key);
        } else {
            tracing::error!("Call {} failed ({:?}): {}", self.key, err.class(), err);
            self.reporter.report(NoticeLevel::Error, &err.to_string());
        }
        self.hang_up().await;
    }

    async fn send(&self, event: CallEvent) -> Result<(), CallError> {
        tracing::debug!("-> {} {}", event.name(), self.key);
        self.signaling
            .send(CallMessage::new(self.key.clone(), event))
            .await
            .map_err(CallError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::error::MediaError;
    use crate::calling::media::TrackKind;
    use crate::calling::sim::{
        sample_answer, sample_offer, Cue, RecordingCues, RecordingGateway, RecordingReporter,
        SimConnectionFactory, SimDevices, SimOp,
    };
    use crate::calling::signaling::{IceCandidateInit, SdpType};
    use crate::calling::transport::TrackChange;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        session: CallSession,
        factory: Arc<SimConnectionFactory>,
        devices: Arc<SimDevices>,
        gateway: Arc<RecordingGateway>,
        cues: Arc<RecordingCues>,
        reporter: Arc<RecordingReporter>,
    }

    fn key() -> CallKey {
        CallKey::new("usrPeer", 11)
    }

    fn harness(role: CallRole, mode: MediaMode) -> Harness {
        let factory = Arc::new(SimConnectionFactory::new());
        let devices = Arc::new(SimDevices::new());
        let gateway = Arc::new(RecordingGateway::new());
        let cues = Arc::new(RecordingCues::default());
        let reporter = Arc::new(RecordingReporter::default());
        let mut options = CallOptions::new(key(), role, mode);
        options.remote_hangup_delay = Duration::ZERO;
        let session = CallSession::new(
            options,
            CallDeps {
                connections: factory.clone(),
                devices: devices.clone(),
                signaling: gateway.clone(),
                cues: cues.clone(),
                reporter: reporter.clone(),
            },
        );
        Harness {
            session,
            factory,
            devices,
            gateway,
            cues,
            reporter,
        }
    }

    fn msg(event: CallEvent) -> CallMessage {
        CallMessage::new(key(), event)
    }

    fn cand(n: u8) -> IceCandidateInit {
        IceCandidateInit::new(format!("candidate:{} 1 UDP 2130706431 10.2.0.{} 7000 typ host", n, n))
    }

    fn applied_candidates(ops: &[SimOp]) -> Vec<String> {
        ops.iter()
            .filter_map(|o| match o {
                SimOp::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Caller harness taken through start, accept and the first offer.
    async fn offered_caller(mode: MediaMode) -> Harness {
        let mut h = harness(CallRole::Caller, mode);
        assert_ok!(h.session.start().await);
        h.session.on_signal(msg(CallEvent::Accept)).await;
        h.session.process_pending_events().await;
        h
    }

    #[tokio::test]
    async fn test_outgoing_audio_video_call() {
        let mut h = harness(CallRole::Caller, MediaMode::AudioVideo);
        let watch = h.session.watch();

        assert_ok!(h.session.start().await);
        assert_eq!(h.session.phase(), CallPhase::Dialing);
        assert!(h.session.snapshot().waiting_for_peer);
        assert!(watch.borrow().waiting_for_peer);
        assert_eq!(
            h.gateway.events(),
            vec![CallEvent::Invite {
                media_mode: MediaMode::AudioVideo
            }]
        );
        assert_eq!(h.cues.played(), vec![Cue::Dialing]);
        assert!(h.factory.last().is_none(), "no connection before accept");

        h.session.on_signal(msg(CallEvent::Ringing)).await;
        h.session.on_signal(msg(CallEvent::Accept)).await;
        assert_eq!(h.session.phase(), CallPhase::Negotiating);
        assert!(!h.session.snapshot().waiting_for_peer);
        assert!(h.session.negotiator().can_send_offer());
        let conn = h.factory.last().expect("connection created on accept");

        h.session.process_pending_events().await;
        let events = h.gateway.events();
        assert!(events.iter().any(|e| matches!(e, CallEvent::Offer(_))));

        // Peer candidates that beat the answer are held.
        h.session.on_signal(msg(CallEvent::IceCandidate(cand(1)))).await;
        h.session.on_signal(msg(CallEvent::IceCandidate(cand(2)))).await;
        assert!(applied_candidates(&conn.ops()).is_empty());

        h.session.on_signal(msg(CallEvent::Answer(sample_answer()))).await;
        assert!(h.session.negotiator().initial_negotiation_complete());
        assert_eq!(h.session.phase(), CallPhase::Connected);
        assert!(h.session.snapshot().connected_at.is_some());
        assert_eq!(
            applied_candidates(&conn.ops()),
            vec![cand(1).candidate, cand(2).candidate]
        );
        let ops = conn.ops();
        let remote = ops
            .iter()
            .position(|o| *o == SimOp::SetRemote(SdpType::Answer))
            .unwrap();
        let first_candidate = ops
            .iter()
            .position(|o| matches!(o, SimOp::AddCandidate(_)))
            .unwrap();
        assert!(remote < first_candidate);
        assert_eq!(
            h.cues.played(),
            vec![Cue::Dialing, Cue::Ringing, Cue::Stop]
        );
    }

    #[tokio::test]
    async fn test_incoming_audio_only_call_upgrades_video_without_renegotiation() {
        let mut h = harness(CallRole::Callee, MediaMode::AudioOnly);
        assert_ok!(h.session.accept_incoming().await);
        assert_eq!(h.gateway.events(), vec![CallEvent::Accept]);
        assert_eq!(h.session.phase(), CallPhase::Idle);

        h.session.on_signal(msg(CallEvent::Offer(sample_offer()))).await;
        assert_eq!(h.session.phase(), CallPhase::Connected);
        assert!(h.session.negotiator().initial_negotiation_complete());
        let conn = h.factory.last().unwrap();
        let ops = conn.ops();
        assert_eq!(ops[0], SimOp::SetRemote(SdpType::Offer));
        assert!(ops.contains(&SimOp::CreateAnswer));
        assert!(matches!(h.gateway.events().last(), Some(CallEvent::Answer(_))));
        assert!(!h.devices.requests()[0].video);

        let snap = h.session.snapshot();
        assert!(snap.audio_enabled);
        assert!(!snap.video_enabled);

        h.session.process_pending_events().await;
        let offers_before = h
            .gateway
            .events()
            .iter()
            .filter(|e| matches!(e, CallEvent::Offer(_)))
            .count();

        assert_ok!(h.session.toggle_camera().await);
        h.session.process_pending_events().await;
        assert!(h.session.snapshot().video_enabled);
        assert!(conn
            .ops()
            .iter()
            .any(|o| matches!(o, SimOp::ReplaceTrack(TrackKind::Video, _))));
        let offers_after = h
            .gateway
            .events()
            .iter()
            .filter(|e| matches!(e, CallEvent::Offer(_)))
            .count();
        assert_eq!(offers_before, offers_after);
        assert_eq!(offers_after, 0);
    }

    #[tokio::test]
    async fn test_candidates_before_offer_drain_once() {
        let mut h = harness(CallRole::Callee, MediaMode::AudioVideo);
        h.session.on_signal(msg(CallEvent::IceCandidate(cand(1)))).await;
        h.session.on_signal(msg(CallEvent::IceCandidate(cand(2)))).await;
        assert_eq!(h.session.negotiator().pending_candidates(), 2);

        h.session.on_signal(msg(CallEvent::Offer(sample_offer()))).await;
        let conn = h.factory.last().unwrap();
        assert_eq!(
            applied_candidates(&conn.ops()),
            vec![cand(1).candidate, cand(2).candidate]
        );

        // A renegotiation offer must not drain or reattach anything.
        let tracks_before = conn
            .ops()
            .iter()
            .filter(|o| matches!(o, SimOp::AddTrack(..)))
            .count();
        h.session.on_signal(msg(CallEvent::Offer(sample_offer()))).await;
        assert_eq!(h.session.phase(), CallPhase::Connected);
        assert_eq!(applied_candidates(&conn.ops()).len(), 2);
        let tracks_after = conn
            .ops()
            .iter()
            .filter(|o| matches!(o, SimOp::AddTrack(..)))
            .count();
        assert_eq!(tracks_before, tracks_after);
        assert_eq!(h.devices.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_tears_down() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        h.session.on_signal(msg(CallEvent::Answer(sample_answer()))).await;
        assert_eq!(h.session.phase(), CallPhase::Connected);
        let conn = h.factory.last().unwrap();

        conn.fail_ice();
        h.session.process_pending_events().await;
        assert_eq!(h.session.phase(), CallPhase::Closed);
        assert_eq!(conn.close_count(), 1);
        assert_eq!(h.gateway.events().last(), Some(&CallEvent::HangUp));

        let ops_before = conn.ops().len();
        let sent_before = h.gateway.events().len();
        h.session.on_signal(msg(CallEvent::IceCandidate(cand(5)))).await;
        h.session.on_signal(msg(CallEvent::Offer(sample_offer()))).await;
        assert_eq!(conn.ops().len(), ops_before);
        assert_eq!(h.gateway.events().len(), sent_before);
    }

    #[tokio::test]
    async fn test_hang_up_after_transport_failure_is_noop() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        h.session.on_signal(msg(CallEvent::Answer(sample_answer()))).await;
        let conn = h.factory.last().unwrap();

        conn.fail_ice();
        h.session.process_pending_events().await;
        assert_eq!(h.session.phase(), CallPhase::Closed);

        h.session.hang_up().await;
        let hang_ups = h
            .gateway
            .events()
            .iter()
            .filter(|e| **e == CallEvent::HangUp)
            .count();
        assert_eq!(hang_ups, 1);
        assert_eq!(conn.close_count(), 1);
    }

    #[tokio::test]
    async fn test_signaling_closed_tears_down() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        let conn = h.factory.last().unwrap();
        conn.close_signaling();
        h.session.process_pending_events().await;
        assert_eq!(h.session.phase(), CallPhase::Closed);
    }

    #[tokio::test]
    async fn test_candidate_error_is_only_logged() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        let conn = h.factory.last().unwrap();
        conn.fire_candidate_error("stun:stun.example.org:3478", 701, "STUN host lookup failed");
        assert_eq!(h.session.process_pending_events().await, 1);
        assert_eq!(h.session.phase(), CallPhase::Negotiating);
        assert!(h.reporter.notices().is_empty());
    }

    #[tokio::test]
    async fn test_hang_up_is_idempotent() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        let conn = h.factory.last().unwrap();
        let local = h.session.local_media().stream().cloned().unwrap();

        h.session.hang_up().await;
        h.session.hang_up().await;
        let hang_ups = h
            .gateway
            .events()
            .iter()
            .filter(|e| **e == CallEvent::HangUp)
            .count();
        assert_eq!(hang_ups, 1);
        assert_eq!(conn.close_count(), 1);
        assert!(local
            .tracks()
            .iter()
            .all(|t| t.ready_state() == crate::calling::media::TrackState::Ended));
        assert!(h.session.local_media().stream().is_none());
        assert_eq!(h.cues.played().last(), Some(&Cue::Stop));
    }

    #[tokio::test]
    async fn test_hang_up_tears_down_even_if_notify_fails() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        let conn = h.factory.last().unwrap();
        h.gateway.fail_sends(true);

        h.session.hang_up().await;
        assert_eq!(h.session.phase(), CallPhase::Closed);
        assert_eq!(conn.close_count(), 1);
    }

    #[tokio::test]
    async fn test_events_after_teardown_are_dropped() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        let conn = h.factory.last().unwrap();
        h.session.hang_up().await;

        conn.fire_negotiation_needed();
        assert_eq!(h.session.process_pending_events().await, 0);
        let offers = conn
            .ops()
            .iter()
            .filter(|o| **o == SimOp::CreateOffer)
            .count();
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_already_in_call() {
        let mut h = harness(CallRole::Caller, MediaMode::AudioVideo);
        assert_ok!(h.session.start().await);
        let err = assert_err!(h.session.start().await);
        assert_eq!(err, CallError::AlreadyInCall);
        assert_eq!(h.session.phase(), CallPhase::Dialing);
        assert_eq!(
            h.reporter.notices(),
            vec![(NoticeLevel::Info, "you are already in an ongoing call".to_string())]
        );
    }

    #[tokio::test]
    async fn test_permission_denied_cancels_silently() {
        let mut h = harness(CallRole::Caller, MediaMode::AudioVideo);
        h.devices.fail_with(MediaError::PermissionDenied);

        assert_err!(h.session.start().await);
        assert_eq!(h.session.phase(), CallPhase::Closed);
        assert!(h.reporter.notices().is_empty());
        assert_eq!(h.gateway.events(), vec![CallEvent::HangUp]);
    }

    #[tokio::test]
    async fn test_missing_device_is_reported() {
        let mut h = harness(CallRole::Callee, MediaMode::AudioVideo);
        h.devices.fail_with(MediaError::NotFound("no camera".into()));

        h.session.on_signal(msg(CallEvent::Offer(sample_offer()))).await;
        assert_eq!(h.session.phase(), CallPhase::Closed);
        let notices = h.reporter.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, NoticeLevel::Error);
        assert_eq!(h.factory.last().unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_answer_keeps_phase() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        h.session
            .on_signal(msg(CallEvent::Answer(SessionDescription::answer("junk"))))
            .await;
        assert_eq!(h.session.phase(), CallPhase::Negotiating);
        assert_eq!(h.reporter.notices().len(), 1);

        h.session.on_signal(msg(CallEvent::Answer(sample_answer()))).await;
        assert_eq!(h.session.phase(), CallPhase::Connected);
    }

    #[tokio::test]
    async fn test_malformed_signal_tears_down() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        h.session
            .on_inbound(InboundSignal::Malformed {
                key: key(),
                reason: "bad offer payload".into(),
            })
            .await;
        assert_eq!(h.session.phase(), CallPhase::Closed);
        assert_eq!(h.gateway.events().last(), Some(&CallEvent::HangUp));
        assert_eq!(h.reporter.notices()[0].0, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_remote_hang_up_while_dialing_plays_ended_cue() {
        let mut h = harness(CallRole::Caller, MediaMode::AudioVideo);
        assert_ok!(h.session.start().await);
        h.session.on_signal(msg(CallEvent::HangUp)).await;

        assert_eq!(h.session.phase(), CallPhase::Closed);
        assert_eq!(
            h.cues.played(),
            vec![Cue::Dialing, Cue::Stop, Cue::Ended, Cue::Stop]
        );
    }

    #[tokio::test]
    async fn test_remote_hang_up_when_connected() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        h.session.on_signal(msg(CallEvent::Answer(sample_answer()))).await;
        h.session.on_signal(msg(CallEvent::HangUp)).await;
        assert_eq!(h.session.phase(), CallPhase::Closed);
        assert!(!h.cues.played().contains(&Cue::Ended));
    }

    #[tokio::test]
    async fn test_other_call_messages_are_ignored() {
        let mut h = harness(CallRole::Callee, MediaMode::AudioVideo);
        h.session
            .on_signal(CallMessage::new(
                CallKey::new("usrPeer", 12),
                CallEvent::Offer(sample_offer()),
            ))
            .await;
        assert_eq!(h.session.phase(), CallPhase::Idle);
        assert!(h.factory.last().is_none());
    }

    #[tokio::test]
    async fn test_overlapping_camera_toggle_is_dropped() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        assert!(h.session.local.begin_toggle());
        assert_ok!(h.session.toggle_camera().await);
        assert!(h.session.snapshot().video_enabled, "toggle was not applied");
        h.session.local.end_toggle();

        assert_ok!(h.session.toggle_camera().await);
        assert!(!h.session.snapshot().video_enabled);
        assert!(!h.session.snapshot().video_toggle_in_progress);
    }

    #[tokio::test]
    async fn test_toggle_mic_only_touches_audio() {
        let mut h = offered_caller(MediaMode::AudioVideo).await;
        h.session.toggle_mic();
        let snap = h.session.snapshot();
        assert!(!snap.audio_enabled);
        assert!(snap.video_enabled);
        h.session.toggle_mic();
        assert!(h.session.snapshot().audio_enabled);
    }

    #[tokio::test]
    async fn test_remote_track_updates_snapshot() {
        let mut h = harness(CallRole::Callee, MediaMode::AudioVideo);
        h.session.on_signal(msg(CallEvent::Offer(sample_offer()))).await;
        h.session.process_pending_events().await;
        let snap = h.session.snapshot();
        assert!(snap.remote_stream_id.is_some());
        assert!(snap.remote_live);

        let conn = h.factory.last().unwrap();
        let video = conn
            .remote_tracks()
            .into_iter()
            .find(|t| t.kind() == TrackKind::Video)
            .unwrap();
        conn.change_remote_track(video.id(), TrackChange::Muted);
        h.session.process_pending_events().await;
        assert!(!h.session.snapshot().remote_live);
        assert_eq!(h.session.phase(), CallPhase::Connected);
    }

    #[tokio::test]
    async fn test_run_loop_hangs_up_when_controller_drops() {
        let h = harness(CallRole::Caller, MediaMode::AudioOnly);
        let gateway = h.gateway.clone();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (_sig_tx, sig_rx) = mpsc::unbounded_channel();

        assert_ok!(cmd_tx.send(CallCommand::Start));
        drop(cmd_tx);
        let last = h.session.run(cmd_rx, sig_rx).await;
        assert_eq!(last.phase, CallPhase::Closed);
        assert_eq!(
            gateway.events(),
            vec![
                CallEvent::Invite {
                    media_mode: MediaMode::AudioOnly
                },
                CallEvent::HangUp
            ]
        );
    }
}
