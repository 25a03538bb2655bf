//! Control surface of the media-transport connection.
//!
//! Only what the negotiator drives is modelled here: description exchange,
//! track attachment/replacement, candidates, lifecycle events and close. ICE,
//! DTLS and SRTP live behind the implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::TransportError;
use super::media::{MediaStream, MediaTrack, TrackKind};
use super::signaling::{IceCandidateInit, SessionDescription};

/// STUN/TURN server handed to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// State change of a remote track after it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChange {
    Ended,
    Muted,
    Unmuted,
}

/// Events delivered to subscribers of a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    NegotiationNeeded,
    /// A local candidate was gathered; `None` marks end of candidates.
    LocalCandidate(Option<IceCandidateInit>),
    CandidateError {
        url: String,
        code: u16,
        text: String,
    },
    IceConnectionStateChange(IceConnectionState),
    IceGatheringStateChange(IceGatheringState),
    SignalingStateChange(SignalingState),
    /// A remote track arrived as part of `stream`.
    Track {
        track: Arc<dyn MediaTrack>,
        stream: MediaStream,
    },
    RemoteTrackChanged {
        track_id: String,
        change: TrackChange,
    },
}

pub type EventSink = mpsc::UnboundedSender<ConnectionEvent>;

/// Handle returned by [`PeerConnection::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One media-transport connection.
///
/// Every operation fails with [`TransportError::Closed`] after [`close`].
///
/// [`close`]: PeerConnection::close
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;
    fn local_description(&self) -> Option<SessionDescription>;

    /// Attach a local track, creating an outbound sender for it.
    fn add_track(&self, track: Arc<dyn MediaTrack>, stream: &MediaStream)
        -> Result<(), TransportError>;
    /// Swap the track behind the first sender of `kind` without renegotiating.
    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Arc<dyn MediaTrack>,
    ) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), TransportError>;

    /// Register a sink for connection events.
    fn subscribe(&self, sink: EventSink) -> SubscriptionId;
    /// Stop delivering events to a sink. No event is sent to it afterwards.
    fn unsubscribe(&self, id: SubscriptionId);

    fn close(&self);
}

/// Creates connections.
pub trait ConnectionFactory: Send + Sync {
    /// `config` is `None` when no ICE servers are configured.
    fn create(
        &self,
        config: Option<&RtcConfiguration>,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}
