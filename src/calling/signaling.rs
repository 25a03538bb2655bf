//! Call signaling contract: the messages exchanged with the peer over the
//! application's messaging channel, and the gateway capability that sends them.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::SignalingError;
use super::MediaMode;

/// Identifies one call: the conversation topic plus the sequence id of the
/// message that started it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub topic: String,
    pub seq: u64,
}

impl CallKey {
    pub fn new(topic: impl Into<String>, seq: u64) -> Self {
        Self {
            topic: topic.into(),
            seq,
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.seq)
    }
}

/// Session description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description exchanged during offer/answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in its JSON wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct InvitePayload {
    #[serde(rename = "audioOnly")]
    audio_only: bool,
}

/// Call-control event carried by a signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// Call invitation from the caller.
    Invite { media_mode: MediaMode },
    Ringing,
    Accept,
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidateInit),
    HangUp,
}

impl CallEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::Invite { .. } => "invite",
            CallEvent::Ringing => "ringing",
            CallEvent::Accept => "accept",
            CallEvent::Offer(_) => "offer",
            CallEvent::Answer(_) => "answer",
            CallEvent::IceCandidate(_) => "ice-candidate",
            CallEvent::HangUp => "hang-up",
        }
    }

    /// Decode an event from its wire name and payload.
    ///
    /// Returns `Ok(None)` for event names this side does not know.
    pub fn decode(
        name: &str,
        payload: serde_json::Value,
    ) -> Result<Option<CallEvent>, serde_json::Error> {
        let event = match name {
            "invite" => {
                let p: InvitePayload = serde_json::from_value(payload)?;
                CallEvent::Invite {
                    media_mode: if p.audio_only {
                        MediaMode::AudioOnly
                    } else {
                        MediaMode::AudioVideo
                    },
                }
            }
            "ringing" => CallEvent::Ringing,
            "accept" => CallEvent::Accept,
            "offer" => CallEvent::Offer(serde_json::from_value(payload)?),
            "answer" => CallEvent::Answer(serde_json::from_value(payload)?),
            "ice-candidate" => CallEvent::IceCandidate(serde_json::from_value(payload)?),
            "hang-up" => CallEvent::HangUp,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// JSON payload for this event, if it carries one.
    pub fn payload(&self) -> Option<serde_json::Value> {
        match self {
            CallEvent::Invite { media_mode } => Some(serde_json::json!({
                "audioOnly": *media_mode == MediaMode::AudioOnly
            })),
            CallEvent::Offer(desc) | CallEvent::Answer(desc) => serde_json::to_value(desc).ok(),
            CallEvent::IceCandidate(c) => serde_json::to_value(c).ok(),
            CallEvent::Ringing | CallEvent::Accept | CallEvent::HangUp => None,
        }
    }
}

/// One signaling message scoped to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMessage {
    pub key: CallKey,
    pub event: CallEvent,
}

impl CallMessage {
    pub fn new(key: CallKey, event: CallEvent) -> Self {
        Self { key, event }
    }

    /// Build the info envelope understood by [`super::parse_call_message`].
    pub fn to_envelope(&self) -> serde_json::Value {
        let mut info = serde_json::json!({
            "topic": self.key.topic,
            "seq": self.key.seq,
            "what": "call",
            "event": self.event.name(),
        });
        if let Some(payload) = self.event.payload() {
            info["payload"] = payload;
        }
        serde_json::json!({ "info": info })
    }
}

/// What the messaging channel hands to a call session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    Message(CallMessage),
    /// A call event whose payload could not be decoded.
    Malformed { key: CallKey, reason: String },
}

impl InboundSignal {
    pub fn key(&self) -> &CallKey {
        match self {
            InboundSignal::Message(msg) => &msg.key,
            InboundSignal::Malformed { key, .. } => key,
        }
    }
}

/// Outbound half of the signaling channel.
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    async fn send(&self, message: CallMessage) -> Result<(), SignalingError>;
}
