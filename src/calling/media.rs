//! Local media acquisition and the camera/microphone toggles.
//!
//! Tracks are shared handles (`Arc<dyn MediaTrack>`): the same track object is
//! held by the local media set, the preview and the connection's sender, so
//! stopping or disabling it is visible everywhere.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::error::{CallError, MediaError};
use super::placeholder::{PlaceholderConfig, PlaceholderVideoTrack};
use super::transport::PeerConnection;
use super::MediaMode;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Liveness of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// A single audio or video track as exposed by the device layer or the
/// connection.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn ready_state(&self) -> TrackState;
    /// Remote tracks report muted while the peer sends no media.
    fn muted(&self) -> bool {
        false
    }
    /// Release the underlying source. The track stays `Ended` afterwards.
    fn stop(&self);

    fn is_live(&self) -> bool {
        self.enabled() && self.ready_state() == TrackState::Live && !self.muted()
    }
}

/// An ordered set of tracks (the local media set, or a remote stream).
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    pub fn remove_track(&mut self, id: &str) -> Option<Arc<dyn MediaTrack>> {
        let idx = self.tracks.iter().position(|t| t.id() == id)?;
        Some(self.tracks.remove(idx))
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn first_audio(&self) -> Option<&Arc<dyn MediaTrack>> {
        self.audio_tracks().next()
    }

    pub fn first_video(&self) -> Option<&Arc<dyn MediaTrack>> {
        self.video_tracks().next()
    }

    /// Stop and disable every track in the set.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
            track.set_enabled(false);
        }
    }
}

/// Which devices to capture from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn for_mode(mode: MediaMode) -> Self {
        Self {
            audio: true,
            video: mode.wants_video(),
        }
    }

    pub fn video_only() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

/// The device layer: captures microphone and camera.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints)
        -> Result<MediaStream, MediaError>;
}

/// A rendering slot (local preview or remote view) that a stream can be
/// attached to.
#[derive(Debug, Default)]
pub struct Viewport {
    stream: Option<MediaStream>,
}

impl Viewport {
    pub fn attach(&mut self, stream: MediaStream) {
        self.stream = Some(stream);
    }

    pub fn detach(&mut self) -> Option<MediaStream> {
        self.stream.take()
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    /// Stop every track showing in this viewport and clear it.
    pub fn stop_tracks(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
        }
    }
}

/// Local captured media for one call plus its preview.
pub struct LocalMedia {
    devices: Arc<dyn MediaDevices>,
    placeholder: PlaceholderConfig,
    stream: Option<MediaStream>,
    preview: Viewport,
    toggle_in_progress: bool,
}

impl LocalMedia {
    pub fn new(devices: Arc<dyn MediaDevices>, placeholder: PlaceholderConfig) -> Self {
        Self {
            devices,
            placeholder,
            stream: None,
            preview: Viewport::default(),
            toggle_in_progress: false,
        }
    }

    pub fn has_media(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn preview(&self) -> &Viewport {
        &self.preview
    }

    /// Capture audio (and video, unless audio-only) and show it in the
    /// preview.
    ///
    /// Audio-only calls get a disabled placeholder video track so a video
    /// sender exists on the connection and the camera can be switched on
    /// mid-call by replacing the track instead of renegotiating.
    pub async fn acquire(&mut self, mode: MediaMode) -> Result<MediaStream, MediaError> {
        let mut stream = self
            .devices
            .get_user_media(MediaConstraints::for_mode(mode))
            .await?;

        if !mode.wants_video() {
            let placeholder = PlaceholderVideoTrack::new(&self.placeholder);
            tracing::debug!("Audio-only call: adding placeholder video track {}", placeholder.id());
            stream.add_track(Arc::new(placeholder));
        }

        tracing::info!(
            "Local media acquired ({}): {} track(s)",
            mode.as_str(),
            stream.tracks().len()
        );
        self.preview.attach(stream.clone());
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Drop the placeholder video track from the local set once it has been
    /// attached to the connection. The sender keeps the (stopped) track.
    pub fn drop_placeholder(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let placeholders: Vec<String> = stream
            .video_tracks()
            .filter(|t| PlaceholderVideoTrack::is_placeholder_id(t.id()))
            .map(|t| t.id().to_string())
            .collect();
        for id in placeholders {
            if let Some(track) = stream.remove_track(&id) {
                track.stop();
            }
        }
        self.preview.attach(stream.clone());
    }

    pub fn audio_enabled(&self) -> bool {
        self.stream
            .as_ref()
            .and_then(|s| s.first_audio())
            .is_some_and(|t| t.enabled())
    }

    /// True when the camera is on: a live, enabled video track is attached.
    pub fn video_live(&self) -> bool {
        self.stream
            .as_ref()
            .and_then(|s| s.first_video())
            .is_some_and(|t| t.is_live())
    }

    pub fn toggle_in_progress(&self) -> bool {
        self.toggle_in_progress
    }

    /// Claim the toggle slot. Returns false when another toggle is running.
    pub fn begin_toggle(&mut self) -> bool {
        if self.toggle_in_progress {
            return false;
        }
        self.toggle_in_progress = true;
        true
    }

    pub fn end_toggle(&mut self) {
        self.toggle_in_progress = false;
    }

    /// Turn the camera off: stop the video track and drop it from the local
    /// set. Returns false if there was no video track to stop.
    pub fn mute_video(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let Some(id) = stream.first_video().map(|t| t.id().to_string()) else {
            return false;
        };
        if let Some(track) = stream.remove_track(&id) {
            track.set_enabled(false);
            track.stop();
            tracing::info!("Camera off (track {})", id);
        }
        self.preview.attach(stream.clone());
        true
    }

    /// Turn the camera on: capture a fresh video track, swap it into the
    /// connection's video sender and add it to the local set.
    ///
    /// Without a connection (call not accepted yet) the track is only added
    /// locally; it is attached together with the rest of the set later.
    pub async fn unmute_video(
        &mut self,
        connection: Option<&Arc<dyn PeerConnection>>,
    ) -> Result<(), CallError> {
        if self.stream.is_none() {
            return Err(CallError::Media(MediaError::Other(
                "no local media to add video to".into(),
            )));
        }

        let captured = self
            .devices
            .get_user_media(MediaConstraints::video_only())
            .await?;
        let track = captured
            .first_video()
            .cloned()
            .ok_or_else(|| MediaError::NotFound("camera returned no video track".into()))?;

        self.preview.detach();
        if let Some(conn) = connection {
            if let Err(e) = conn.replace_track(TrackKind::Video, track.clone()).await {
                track.stop();
                if let Some(stream) = self.stream.as_ref() {
                    self.preview.attach(stream.clone());
                }
                return Err(e.into());
            }
        }

        if let Some(stream) = self.stream.as_mut() {
            if let Some(stale) = stream.first_video().map(|t| t.id().to_string()) {
                if let Some(old) = stream.remove_track(&stale) {
                    old.stop();
                }
            }
            stream.add_track(track.clone());
            self.preview.attach(stream.clone());
        }
        tracing::info!("Camera on (track {})", track.id());
        Ok(())
    }

    /// Flip the microphone's enabled flag. Returns the new state, or `None`
    /// without an audio track.
    pub fn toggle_mic(&mut self) -> Option<bool> {
        let track = self.stream.as_ref()?.first_audio()?;
        let enabled = !track.enabled();
        track.set_enabled(enabled);
        tracing::info!("Microphone {}", if enabled { "on" } else { "off" });
        Some(enabled)
    }

    /// Stop all local tracks and forget the set.
    pub fn release(&mut self) {
        self.preview.stop_tracks();
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
        }
        self.toggle_in_progress = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::sim::{SimConnection, SimDevices};
    use tokio_test::{assert_err, assert_ok};

    fn local(devices: Arc<SimDevices>) -> LocalMedia {
        LocalMedia::new(devices, PlaceholderConfig::default())
    }

    #[tokio::test]
    async fn test_acquire_audio_video() {
        let devices = Arc::new(SimDevices::new());
        let mut media = local(devices.clone());

        let stream = assert_ok!(media.acquire(MediaMode::AudioVideo).await);
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);
        assert!(media.video_live());
        assert!(media.audio_enabled());
        assert_eq!(
            media.preview().stream().map(|s| s.id().to_string()),
            Some(stream.id().to_string())
        );
        assert_eq!(
            devices.requests(),
            vec![MediaConstraints {
                audio: true,
                video: true
            }]
        );
    }

    #[tokio::test]
    async fn test_acquire_audio_only_adds_disabled_placeholder() {
        let devices = Arc::new(SimDevices::new());
        let mut media = local(devices.clone());

        let stream = assert_ok!(media.acquire(MediaMode::AudioOnly).await);
        let video = stream.first_video().expect("placeholder video track");
        assert!(PlaceholderVideoTrack::is_placeholder_id(video.id()));
        assert!(!video.enabled());
        assert!(!media.video_live());
        assert!(!devices.requests()[0].video);

        media.drop_placeholder();
        assert!(media.stream().unwrap().first_video().is_none());
        assert_eq!(video.ready_state(), TrackState::Ended);
    }

    #[tokio::test]
    async fn test_acquire_reports_device_errors() {
        let devices = Arc::new(SimDevices::new());
        devices.fail_with(MediaError::PermissionDenied);
        let mut media = local(devices);

        let err = assert_err!(media.acquire(MediaMode::AudioVideo).await);
        assert_eq!(err, MediaError::PermissionDenied);
        assert!(!media.has_media());
    }

    #[tokio::test]
    async fn test_mute_then_unmute_restores_one_live_video_track() {
        let devices = Arc::new(SimDevices::new());
        let mut media = local(devices);
        assert_ok!(media.acquire(MediaMode::AudioVideo).await);
        let audio = media.stream().unwrap().first_audio().cloned().unwrap();
        let conn: Arc<dyn PeerConnection> = Arc::new(SimConnection::new(None));
        for track in media.stream().unwrap().tracks() {
            assert_ok!(conn.add_track(track.clone(), media.stream().unwrap()));
        }

        assert!(media.mute_video());
        assert!(!media.video_live());
        assert!(!media.mute_video(), "second mute is a no-op");

        assert_ok!(media.unmute_video(Some(&conn)).await);
        let stream = media.stream().unwrap();
        assert_eq!(stream.video_tracks().count(), 1);
        assert!(media.video_live());
        assert_eq!(
            media.preview().stream().map(|s| s.id().to_string()),
            Some(stream.id().to_string())
        );
        assert!(audio.enabled());
        assert_eq!(audio.ready_state(), TrackState::Live);
    }

    #[tokio::test]
    async fn test_unmute_failure_keeps_preview() {
        let devices = Arc::new(SimDevices::new());
        let mut media = local(devices.clone());
        assert_ok!(media.acquire(MediaMode::AudioOnly).await);
        media.drop_placeholder();

        devices.fail_with(MediaError::NotFound("camera".into()));
        let err = assert_err!(media.unmute_video(None).await);
        assert!(matches!(err, CallError::Media(MediaError::NotFound(_))));
        assert!(media.preview().stream().is_some());

        devices.clear_failure();
        assert_ok!(media.unmute_video(None).await);
        assert!(media.video_live());
    }

    #[tokio::test]
    async fn test_toggle_mic_flips_audio_only() {
        let devices = Arc::new(SimDevices::new());
        let mut media = local(devices);
        assert_ok!(media.acquire(MediaMode::AudioVideo).await);

        assert_eq!(media.toggle_mic(), Some(false));
        assert!(!media.audio_enabled());
        assert!(media.video_live());
        assert_eq!(media.toggle_mic(), Some(true));
    }

    #[test]
    fn test_toggle_slot_is_exclusive() {
        let mut media = local(Arc::new(SimDevices::new()));
        assert!(media.begin_toggle());
        assert!(!media.begin_toggle());
        media.end_toggle();
        assert!(media.begin_toggle());
    }
}
