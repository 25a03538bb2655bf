//! In-process stand-ins for the device layer, the connection and the
//! signaling transport.
//!
//! Used by the loopback call test and by unit tests. The simulated connection
//! follows the offer/answer state machine closely enough to catch ordering
//! mistakes: descriptions are validated, candidates need a remote description,
//! answers need a remote offer, and nothing works after close.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::cues::CallCues;
use super::error::{MediaError, SignalingError, TransportError};
use super::media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind, TrackState};
use super::parse_call_message;
use super::session::{CallReporter, NoticeLevel};
use super::signaling::{
    CallEvent, CallMessage, IceCandidateInit, InboundSignal, SdpType, SessionDescription,
    SignalingGateway,
};
use super::transport::{
    ConnectionEvent, ConnectionFactory, EventSink, IceConnectionState, IceGatheringState,
    PeerConnection, RtcConfiguration, SignalingState, SubscriptionId, TrackChange,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A track with no media behind it.
#[derive(Debug)]
pub struct SimTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended: AtomicBool,
    muted: AtomicBool,
}

impl SimTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            muted: AtomicBool::new(false),
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }
}

impl MediaTrack for SimTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn ready_state(&self) -> TrackState {
        if self.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

/// Microphone and camera that always work unless told to fail.
#[derive(Debug, Default)]
pub struct SimDevices {
    failure: Mutex<Option<MediaError>>,
    requests: Mutex<Vec<MediaConstraints>>,
}

impl SimDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following capture fail with `err`.
    pub fn fail_with(&self, err: MediaError) {
        *lock(&self.failure) = Some(err);
    }

    pub fn clear_failure(&self) {
        *lock(&self.failure) = None;
    }

    /// Constraints of every capture request so far.
    pub fn requests(&self) -> Vec<MediaConstraints> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl MediaDevices for SimDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        lock(&self.requests).push(constraints);
        if let Some(err) = lock(&self.failure).clone() {
            return Err(err);
        }

        let n = next_id();
        let mut stream = MediaStream::new(format!("local-{}", uuid::Uuid::new_v4()));
        if constraints.audio {
            stream.add_track(Arc::new(SimTrack::new(format!("mic-{}", n), TrackKind::Audio)));
        }
        if constraints.video {
            stream.add_track(Arc::new(SimTrack::new(format!("cam-{}", n), TrackKind::Video)));
        }
        Ok(stream)
    }
}

/// Operations recorded by [`SimConnection`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    AddTrack(TrackKind, String),
    ReplaceTrack(TrackKind, String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

#[derive(Debug)]
struct Sender {
    kind: TrackKind,
    track: Arc<dyn MediaTrack>,
    stream_id: String,
}

struct ConnectionState {
    ops: Vec<SimOp>,
    senders: Vec<Sender>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    signaling: SignalingState,
    ice: IceConnectionState,
    negotiation_pending: bool,
    gathered: bool,
    remote_stream: MediaStream,
    remote_tracks: Vec<Arc<SimTrack>>,
    subscribers: Vec<(SubscriptionId, EventSink)>,
    next_subscription: u64,
    closed: bool,
    close_count: usize,
    version: u32,
}

impl ConnectionState {
    fn emit(&mut self, event: ConnectionEvent) {
        self.subscribers
            .retain(|(_, sink)| sink.send(event.clone()).is_ok());
    }

    fn set_signaling(&mut self, state: SignalingState) {
        if self.signaling != state {
            self.signaling = state;
            self.emit(ConnectionEvent::SignalingStateChange(state));
        }
    }

    fn set_ice(&mut self, state: IceConnectionState) {
        if self.ice != state {
            self.ice = state;
            self.emit(ConnectionEvent::IceConnectionStateChange(state));
        }
    }
}

/// Simulated media-transport connection.
pub struct SimConnection {
    serial: u64,
    config: Option<RtcConfiguration>,
    state: Mutex<ConnectionState>,
}

impl SimConnection {
    pub fn new(config: Option<RtcConfiguration>) -> Self {
        let serial = next_id();
        Self {
            serial,
            config,
            state: Mutex::new(ConnectionState {
                ops: Vec::new(),
                senders: Vec::new(),
                local: None,
                remote: None,
                signaling: SignalingState::Stable,
                ice: IceConnectionState::New,
                negotiation_pending: false,
                gathered: false,
                remote_stream: MediaStream::new(format!("remote-{}", serial)),
                remote_tracks: Vec::new(),
                subscribers: Vec::new(),
                next_subscription: 1,
                closed: false,
                close_count: 0,
                version: 0,
            }),
        }
    }

    pub fn config(&self) -> Option<&RtcConfiguration> {
        self.config.as_ref()
    }

    pub fn ops(&self) -> Vec<SimOp> {
        lock(&self.state).ops.clone()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).close_count
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    pub fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    pub fn remote_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        lock(&self.state)
            .remote_tracks
            .iter()
            .map(|t| t.clone() as Arc<dyn MediaTrack>)
            .collect()
    }

    /// Drop connectivity.
    pub fn fail_ice(&self) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.set_ice(IceConnectionState::Failed);
        }
    }

    /// Shut the signaling side down as if the remote end went away.
    pub fn close_signaling(&self) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.set_signaling(SignalingState::Closed);
        }
    }

    /// Ask for a new offer regardless of pending state.
    pub fn fire_negotiation_needed(&self) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.emit(ConnectionEvent::NegotiationNeeded);
        }
    }

    /// Report a STUN/TURN failure during gathering.
    pub fn fire_candidate_error(&self, url: &str, code: u16, text: &str) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.emit(ConnectionEvent::CandidateError {
                url: url.to_string(),
                code,
                text: text.to_string(),
            });
        }
    }

    /// Change a remote track as if the peer stopped or resumed sending.
    pub fn change_remote_track(&self, track_id: &str, change: TrackChange) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        let Some(track) = state.remote_tracks.iter().find(|t| t.id() == track_id).cloned() else {
            return;
        };
        match change {
            TrackChange::Muted => track.set_muted(true),
            TrackChange::Unmuted => track.set_muted(false),
            TrackChange::Ended => track.stop(),
        }
        state.emit(ConnectionEvent::RemoteTrackChanged {
            track_id: track_id.to_string(),
            change,
        });
    }

    fn render_sdp(&self, state: &mut ConnectionState) -> String {
        state.version += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.serial, state.version
        );
        for (mid, sender) in state.senders.iter().enumerate() {
            sdp.push_str(&media_section(
                sender.kind,
                mid,
                &sender.stream_id,
                sender.track.id(),
                sender.track.is_live(),
            ));
        }
        sdp
    }

    fn gather(&self, state: &mut ConnectionState) {
        if state.gathered {
            return;
        }
        state.gathered = true;
        state.emit(ConnectionEvent::IceGatheringStateChange(IceGatheringState::Gathering));
        for (n, port) in [(1u32, 50000 + self.serial % 1000), (2, 51000 + self.serial % 1000)] {
            let candidate = IceCandidateInit::new(format!(
                "candidate:{} 1 udp {} 192.0.2.{} {} typ host",
                n,
                2_122_260_223u32 - n,
                self.serial % 250 + 1,
                port
            ));
            state.emit(ConnectionEvent::LocalCandidate(Some(candidate)));
        }
        state.emit(ConnectionEvent::LocalCandidate(None));
        state.emit(ConnectionEvent::IceGatheringStateChange(IceGatheringState::Complete));
    }

    fn apply_remote_tracks(state: &mut ConnectionState, sdp: &str) {
        for section in parse_media_sections(sdp) {
            if state.remote_tracks.iter().any(|t| t.id() == section.track_id) {
                continue;
            }
            let track = Arc::new(SimTrack::new(section.track_id, section.kind));
            track.set_muted(!section.sending);
            state.remote_tracks.push(track.clone());
            state.remote_stream.add_track(track.clone());
            let stream = state.remote_stream.clone();
            state.emit(ConnectionEvent::Track {
                track: track as Arc<dyn MediaTrack>,
                stream,
            });
        }
    }

    fn maybe_connect(state: &mut ConnectionState) {
        if state.local.is_some() && state.remote.is_some() && state.ice == IceConnectionState::New
        {
            state.set_ice(IceConnectionState::Checking);
            state.set_ice(IceConnectionState::Connected);
        }
    }
}

#[async_trait]
impl PeerConnection for SimConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.ops.push(SimOp::CreateOffer);
        state.negotiation_pending = false;
        Ok(SessionDescription::offer(self.render_sdp(&mut state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::Other("no remote offer to answer".into()));
        }
        state.ops.push(SimOp::CreateAnswer);
        Ok(SessionDescription::answer(self.render_sdp(&mut state)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        let next = match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(TransportError::Other(format!(
                    "cannot set local {:?} in {:?}",
                    kind, current
                )))
            }
        };
        state.ops.push(SimOp::SetLocal(desc.sdp_type));
        state.local = Some(desc);
        state.set_signaling(next);
        self.gather(&mut state);
        Self::maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(TransportError::InvalidDescription(
                "missing protocol version line".into(),
            ));
        }
        let next = match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(TransportError::Other(format!(
                    "cannot set remote {:?} in {:?}",
                    kind, current
                )))
            }
        };
        state.ops.push(SimOp::SetRemote(desc.sdp_type));
        Self::apply_remote_tracks(&mut state, &desc.sdp);
        state.remote = Some(desc);
        state.set_signaling(next);
        Self::maybe_connect(&mut state);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    fn add_track(
        &self,
        track: Arc<dyn MediaTrack>,
        stream: &MediaStream,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.senders.iter().any(|s| s.track.id() == track.id()) {
            return Err(TransportError::Other(format!(
                "track {} already has a sender",
                track.id()
            )));
        }
        state
            .ops
            .push(SimOp::AddTrack(track.kind(), track.id().to_string()));
        state.senders.push(Sender {
            kind: track.kind(),
            track,
            stream_id: stream.id().to_string(),
        });
        if state.signaling == SignalingState::Stable && !state.negotiation_pending {
            state.negotiation_pending = true;
            state.emit(ConnectionEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Arc<dyn MediaTrack>,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        let id = track.id().to_string();
        let sender = state
            .senders
            .iter_mut()
            .find(|s| s.kind == kind)
            .ok_or(TransportError::NoSender(kind.as_str()))?;
        sender.track = track;
        state.ops.push(SimOp::ReplaceTrack(kind, id));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.remote.is_none() {
            return Err(TransportError::Other(
                "candidate before remote description".into(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::InvalidCandidate(candidate.candidate));
        }
        state.ops.push(SimOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn subscribe(&self, sink: EventSink) -> SubscriptionId {
        let mut state = lock(&self.state);
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;
        state.subscribers.push((id, sink));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.state).subscribers.retain(|(sub, _)| *sub != id);
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.close_count += 1;
        if state.closed {
            return;
        }
        state.closed = true;
        state.ops.push(SimOp::Close);
        state.signaling = SignalingState::Closed;
        state.ice = IceConnectionState::Closed;
        for track in &state.remote_tracks {
            track.stop();
        }
    }
}

/// Creates [`SimConnection`]s and keeps hold of them for inspection.
#[derive(Default)]
pub struct SimConnectionFactory {
    created: Mutex<Vec<Arc<SimConnection>>>,
}

impl SimConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<Arc<SimConnection>> {
        lock(&self.created).last().cloned()
    }

    pub fn created(&self) -> usize {
        lock(&self.created).len()
    }
}

impl ConnectionFactory for SimConnectionFactory {
    fn create(
        &self,
        config: Option<&RtcConfiguration>,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let conn = Arc::new(SimConnection::new(config.cloned()));
        lock(&self.created).push(conn.clone());
        Ok(conn)
    }
}

struct MediaSection {
    kind: TrackKind,
    track_id: String,
    sending: bool,
}

fn media_section(kind: TrackKind, mid: usize, stream_id: &str, track_id: &str, sending: bool) -> String {
    let m_line = match kind {
        TrackKind::Audio => "m=audio 9 UDP/TLS/RTP/SAVPF 111",
        TrackKind::Video => "m=video 9 UDP/TLS/RTP/SAVPF 96",
    };
    format!(
        "{}\r\na=mid:{}\r\na=msid:{} {}\r\na={}\r\n",
        m_line,
        mid,
        stream_id,
        track_id,
        if sending { "sendrecv" } else { "recvonly" }
    )
}

fn parse_media_sections(sdp: &str) -> Vec<MediaSection> {
    let mut sections: Vec<MediaSection> = Vec::new();
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("m=") {
            let kind = if rest.starts_with("video") {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            let n = sections.len();
            sections.push(MediaSection {
                kind,
                track_id: format!("remote-{}-{}", kind.as_str(), n),
                sending: true,
            });
        } else if let Some(section) = sections.last_mut() {
            if let Some(msid) = line.strip_prefix("a=msid:") {
                if let Some(track) = msid.split_whitespace().nth(1) {
                    section.track_id = track.to_string();
                }
            } else if line == "a=recvonly" || line == "a=inactive" {
                section.sending = false;
            }
        }
    }
    sections
}

fn sample_sdp() -> String {
    let mut sdp = String::from("v=0\r\no=- 4242 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
    sdp.push_str(&media_section(TrackKind::Audio, 0, "peer-stream", "peer-mic", true));
    sdp.push_str(&media_section(TrackKind::Video, 1, "peer-stream", "peer-cam", true));
    sdp
}

/// Offer from a peer sending audio and video.
pub fn sample_offer() -> SessionDescription {
    SessionDescription::offer(sample_sdp())
}

/// Answer from a peer sending audio and video.
pub fn sample_answer() -> SessionDescription {
    SessionDescription::answer(sample_sdp())
}

/// Gateway that records outgoing messages.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<CallMessage>>,
    failing: AtomicBool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<CallMessage> {
        lock(&self.sent).clone()
    }

    pub fn events(&self) -> Vec<CallEvent> {
        lock(&self.sent).iter().map(|m| m.event.clone()).collect()
    }

    /// Make sends fail (or succeed again).
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingGateway for RecordingGateway {
    async fn send(&self, message: CallMessage) -> Result<(), SignalingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SignalingError("messaging channel offline".into()));
        }
        lock(&self.sent).push(message);
        Ok(())
    }
}

/// Gateway that serializes each message to its wire envelope, parses it
/// back and hands it to the receiving side.
#[derive(Debug, Clone)]
pub struct ChannelGateway {
    tx: mpsc::UnboundedSender<InboundSignal>,
}

impl ChannelGateway {
    pub fn new(tx: mpsc::UnboundedSender<InboundSignal>) -> Self {
        Self { tx }
    }

    /// A gateway plus the receiver the peer reads from.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<InboundSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl SignalingGateway for ChannelGateway {
    async fn send(&self, message: CallMessage) -> Result<(), SignalingError> {
        let wire = message.to_envelope().to_string();
        let Some(signal) = parse_call_message(&wire) else {
            tracing::warn!("Dropping unparseable envelope: {}", wire);
            return Ok(());
        };
        self.tx
            .send(signal)
            .map_err(|_| SignalingError("peer is gone".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Ringing,
    Dialing,
    Ended,
    Stop,
}

/// Cue player that records what it was asked to play.
#[derive(Debug, Default)]
pub struct RecordingCues {
    played: Mutex<Vec<Cue>>,
}

impl RecordingCues {
    pub fn played(&self) -> Vec<Cue> {
        lock(&self.played).clone()
    }
}

impl CallCues for RecordingCues {
    fn play_ringing(&self) {
        lock(&self.played).push(Cue::Ringing);
    }

    fn play_dialing(&self) {
        lock(&self.played).push(Cue::Dialing);
    }

    fn play_ended(&self) {
        lock(&self.played).push(Cue::Ended);
    }

    fn stop(&self) {
        lock(&self.played).push(Cue::Stop);
    }
}

#[derive(Debug, Default)]
pub struct RecordingReporter {
    notices: Mutex<Vec<(NoticeLevel, String)>>,
}

impl RecordingReporter {
    pub fn notices(&self) -> Vec<(NoticeLevel, String)> {
        lock(&self.notices).clone()
    }
}

impl CallReporter for RecordingReporter {
    fn report(&self, level: NoticeLevel, message: &str) {
        lock(&self.notices).push((level, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::signaling::CallKey;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_offer_answer_state_machine() {
        let caller = SimConnection::new(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        caller.subscribe(tx);
        assert_ok!(caller.add_track(
            Arc::new(SimTrack::new("mic", TrackKind::Audio)),
            &MediaStream::new("s")
        ));
        assert!(matches!(rx.try_recv(), Ok(ConnectionEvent::NegotiationNeeded)));

        assert_err!(caller.create_answer().await);
        let offer = assert_ok!(caller.create_offer().await);
        assert!(offer.sdp.contains("a=msid:s mic"));
        assert_ok!(caller.set_local_description(offer.clone()).await);
        assert_eq!(caller.signaling_state(), SignalingState::HaveLocalOffer);

        let callee = SimConnection::new(None);
        assert_ok!(callee.set_remote_description(offer).await);
        assert_eq!(callee.remote_tracks().len(), 1);
        let answer = assert_ok!(callee.create_answer().await);
        assert_ok!(callee.set_local_description(answer.clone()).await);
        assert_ok!(caller.set_remote_description(answer).await);
        assert_eq!(caller.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_local_candidates_follow_local_description() {
        let conn = SimConnection::new(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe(tx);
        assert_ok!(conn.set_remote_description(sample_offer()).await);
        let answer = assert_ok!(conn.create_answer().await);
        assert_ok!(conn.set_local_description(answer).await);

        let mut candidates = 0;
        let mut end_marker = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ConnectionEvent::LocalCandidate(Some(_)) => candidates += 1,
                ConnectionEvent::LocalCandidate(None) => end_marker = true,
                _ => {}
            }
        }
        assert_eq!(candidates, 2);
        assert!(end_marker);
    }

    #[tokio::test]
    async fn test_everything_fails_after_close() {
        let conn = SimConnection::new(None);
        conn.close();
        conn.close();
        assert_eq!(conn.close_count(), 2);
        assert_eq!(
            assert_err!(conn.create_offer().await),
            TransportError::Closed
        );
        assert_eq!(
            assert_err!(conn.add_ice_candidate(IceCandidateInit::new("candidate:1")).await),
            TransportError::Closed
        );
        assert_eq!(conn.ops(), vec![SimOp::Close]);
    }

    #[tokio::test]
    async fn test_replace_track_needs_sender() {
        let conn = SimConnection::new(None);
        let cam: Arc<dyn MediaTrack> = Arc::new(SimTrack::new("cam", TrackKind::Video));
        assert_eq!(
            assert_err!(conn.replace_track(TrackKind::Video, cam).await),
            TransportError::NoSender("video")
        );
    }

    #[tokio::test]
    async fn test_channel_gateway_round_trips_through_envelope() {
        let (gateway, mut rx) = ChannelGateway::pair();
        let msg = CallMessage::new(
            CallKey::new("usrA", 3),
            CallEvent::IceCandidate(IceCandidateInit::new("candidate:1 1 udp 1 192.0.2.1 9 typ host")),
        );
        assert_ok!(gateway.send(msg.clone()).await);
        assert_eq!(assert_ok!(rx.try_recv()), InboundSignal::Message(msg));
    }
}
