//! Placeholder video track for audio-only calls, backed by a blank frame
//! source.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use super::media::{MediaTrack, TrackKind, TrackState};

/// Id prefix marking a track as the synthetic placeholder.
const PLACEHOLDER_PREFIX: &str = "placeholder-video-";

/// Size of the blank frame behind the placeholder track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// A black I420 frame.
pub struct BlankFrame {
    pub width: u32,
    pub height: u32,
    /// Planar I420: Y plane (w*h), U plane (w*h/4), V plane (w*h/4).
    pub data: Vec<u8>,
}

/// Frame source that only ever produces black frames. It never pushes frames
/// on its own; a consumer pulls one when it needs something to encode.
#[derive(Debug, Clone, Copy)]
pub struct BlankFrameSource {
    width: u32,
    height: u32,
}

impl BlankFrameSource {
    pub fn new(config: &PlaceholderConfig) -> Self {
        // I420 chroma planes need even dimensions.
        Self {
            width: config.width.max(2) & !1,
            height: config.height.max(2) & !1,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame(&self) -> BlankFrame {
        let luma = (self.width * self.height) as usize;
        let chroma = luma / 4;
        let mut data = vec![16u8; luma];
        data.resize(luma + 2 * chroma, 128);
        BlankFrame {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

/// Disabled video track that reserves a video sender on the connection.
#[derive(Debug)]
pub struct PlaceholderVideoTrack {
    id: String,
    source: BlankFrameSource,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl PlaceholderVideoTrack {
    pub fn new(config: &PlaceholderConfig) -> Self {
        Self {
            id: format!("{}{}", PLACEHOLDER_PREFIX, uuid::Uuid::new_v4()),
            source: BlankFrameSource::new(config),
            enabled: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        }
    }

    pub fn is_placeholder_id(id: &str) -> bool {
        id.starts_with(PLACEHOLDER_PREFIX)
    }

    pub fn source(&self) -> &BlankFrameSource {
        &self.source
    }
}

impl MediaTrack for PlaceholderVideoTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Video
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

    fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}
