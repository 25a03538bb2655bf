//! Audio cues played at call transitions (ringback, dialing, call ended).
//!
//! Cue playback is process-wide and owned by the application; sessions only
//! trigger it.

/// Audio cue player.
pub trait CallCues: Send + Sync {
    /// Remote side is ringing. Loops until stopped.
    fn play_ringing(&self);
    /// Outgoing call placed.
    fn play_dialing(&self);
    /// Peer hung up before the call connected. Loops until stopped.
    fn play_ended(&self);
    /// Stop and rewind every cue.
    fn stop(&self);
}

/// Cue player for headless use: logs each cue instead of playing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCues;

impl CallCues for LogCues {
    fn play_ringing(&self) {
        tracing::info!("[cue] ringing");
    }

    fn play_dialing(&self) {
        tracing::info!("[cue] dialing");
    }

    fn play_ended(&self) {
        tracing::info!("[cue] call ended");
    }

    fn stop(&self) {
        tracing::debug!("[cue] stop");
    }
}
