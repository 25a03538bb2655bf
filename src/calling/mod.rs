//! Call core: negotiates one peer-to-peer audio/video call over an
//! out-of-band signaling channel and tracks it from dial to hang-up.
//!
//! The signaling transport, the media-transport connection and the device
//! layer are consumed as capabilities (see `signaling`, `transport` and
//! `media`); `session` ties them together.

pub mod candidates;
pub mod cues;
pub mod error;
pub mod media;
pub mod negotiator;
pub mod placeholder;
pub mod session;
pub mod signaling;
pub mod sim;
pub mod transport;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use signaling::{CallEvent, CallKey, CallMessage, InboundSignal};

/// Which side of the call this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    /// Placed the call; sends the first offer.
    Caller,
    /// Received the call; answers the first offer.
    Callee,
}

/// Media requested when the call was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaMode {
    AudioOnly,
    #[default]
    AudioVideo,
}

impl MediaMode {
    pub fn wants_video(self) -> bool {
        self == MediaMode::AudioVideo
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaMode::AudioOnly => "audio-only",
            MediaMode::AudioVideo => "audio-video",
        }
    }
}

/// Call lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    /// Outgoing call, invitation sent, waiting for the peer to accept.
    Dialing,
    /// Description and candidate exchange in flight.
    Negotiating,
    /// Initial negotiation finished; media is live.
    Connected,
    /// Terminal.
    Closed,
}

impl CallPhase {
    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: CallPhase) -> bool {
        use CallPhase::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Dialing) | (Idle, Negotiating) => true,
            (Dialing, Negotiating) => true,
            (Negotiating, Connected) => true,
            (Idle, _) | (Dialing, _) | (Negotiating, _) | (Connected, _) => false,
        }
    }

    pub fn is_closed(self) -> bool {
        self == CallPhase::Closed
    }
}

/// Read-only view of the call handed to the presentation surface.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub role: CallRole,
    pub media_mode: MediaMode,
    pub phase: CallPhase,
    pub waiting_for_peer: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub remote_live: bool,
    pub video_toggle_in_progress: bool,
    pub local_stream_id: Option<String>,
    pub remote_stream_id: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSnapshot {
    pub fn new(role: CallRole, media_mode: MediaMode) -> Self {
        Self {
            role,
            media_mode,
            phase: CallPhase::Idle,
            waiting_for_peer: false,
            audio_enabled: false,
            video_enabled: false,
            remote_live: false,
            video_toggle_in_progress: false,
            local_stream_id: None,
            remote_stream_id: None,
            connected_at: None,
        }
    }
}

/// Raw "info" message as delivered by the messaging channel.
#[derive(Debug, Deserialize)]
struct InfoMessage {
    topic: String,
    seq: u64,
    what: Option<String>,
    event: Option<String>,
    payload: Option<serde_json::Value>,
}

/// Try to parse a call message from an inbound info envelope.
///
/// The envelope is either `{"info": {...}}` or the bare info object. Returns
/// `None` for anything that is not a call message for us to act on: non-call
/// info, unknown events, or unparseable JSON. A call event whose payload
/// cannot be decoded yields [`InboundSignal::Malformed`] so the session can
/// tear the call down.
pub fn parse_call_message(json_str: &str) -> Option<InboundSignal> {
    let v: serde_json::Value = match serde_json::from_str(json_str) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("Ignoring non-JSON info message: {}", e);
            return None;
        }
    };

    let v = match v.get("info") {
        Some(inner) => inner.clone(),
        None => v,
    };

    let info: InfoMessage = match serde_json::from_value(v) {
        Ok(info) => info,
        Err(e) => {
            tracing::debug!("Ignoring info message without topic/seq: {}", e);
            return None;
        }
    };

    if info.what.as_deref() != Some("call") {
        return None;
    }

    let key = CallKey::new(info.topic, info.seq);
    let event_name = info.event.unwrap_or_default();
    let payload = info.payload.unwrap_or(serde_json::Value::Null);

    match CallEvent::decode(&event_name, payload) {
        Ok(Some(event)) => Some(InboundSignal::Message(CallMessage { key, event })),
        Ok(None) => {
            tracing::warn!("Unknown call event {:?} for {}", event_name, key);
            None
        }
        Err(e) => Some(InboundSignal::Malformed {
            key,
            reason: format!("bad {} payload: {}", event_name, e),
        }),
    }
}
