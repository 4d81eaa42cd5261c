//! Media Source Manager: local capture acquisition, quality profiles,
//! track-level enable/disable, and camera↔screen replacement bookkeeping.
//!
//! Raw device access sits behind [`MediaDevices`] so the negotiation core
//! stays testable; `rtc::RtcMediaDevices` is the production implementation.

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::MediaError;
use crate::utils::random_id;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// One locally captured track. `enabled == false` means muted: the track
/// stays attached to every transport, only the flag changes.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub source: TrackSource,
    pub enabled: bool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        let prefix = match source {
            TrackSource::Microphone => "mic",
            TrackSource::Camera => "cam",
            TrackSource::Screen => "screen",
        };
        Self {
            id: format!("{}-{}", prefix, random_id()),
            kind,
            source,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn video(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Video)
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Audio)
    }
}

/// Remote track as reported by a peer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Last-known remote media stream for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

/// Capture quality profile. Chosen from device class plus network hint;
/// `FALLBACK` is the conservative retry profile after a failed acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl MediaProfile {
    pub const DESKTOP: MediaProfile = MediaProfile {
        width: 1280,
        height: 720,
        frame_rate: 30,
        bitrate_kbps: 2500,
        echo_cancellation: true,
        noise_suppression: true,
        auto_gain_control: true,
    };

    pub const MOBILE: MediaProfile = MediaProfile {
        width: 640,
        height: 480,
        frame_rate: 24,
        bitrate_kbps: 1000,
        echo_cancellation: true,
        noise_suppression: true,
        auto_gain_control: true,
    };

    pub const CONSTRAINED: MediaProfile = MediaProfile {
        width: 640,
        height: 360,
        frame_rate: 20,
        bitrate_kbps: 600,
        echo_cancellation: true,
        noise_suppression: true,
        auto_gain_control: true,
    };

    /// Fixed low-end profile with default audio processing, used for the
    /// single retry before acquisition is declared fatal.
    pub const FALLBACK: MediaProfile = MediaProfile {
        width: 320,
        height: 240,
        frame_rate: 15,
        bitrate_kbps: 250,
        echo_cancellation: true,
        noise_suppression: false,
        auto_gain_control: false,
    };
}

/// Display capture plus the externally triggered "capture ended" signal
/// (the user pressing the native stop-sharing control). The receiver fires
/// at most once.
pub struct ScreenCapture {
    pub stream: LocalStream,
    pub ended: oneshot::Receiver<()>,
}

/// Raw device access. Implementations must not block.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open camera and/or microphone with the given profile.
    async fn open_input(
        &self,
        profile: MediaProfile,
        video: bool,
        audio: bool,
    ) -> Result<LocalStream, MediaError>;

    /// Open display capture.
    async fn open_screen(&self) -> Result<ScreenCapture, MediaError>;

    /// Release a track's underlying device resource. Idempotent.
    fn stop(&self, track: &LocalTrack);
}

/// Acquire camera/microphone, retrying exactly once with the fallback
/// profile. A second failure is fatal and propagates to the caller.
pub async fn acquire(
    devices: &dyn MediaDevices,
    profile: MediaProfile,
    video: bool,
    audio: bool,
) -> Result<LocalStream, MediaError> {
    match devices.open_input(profile, video, audio).await {
        Ok(stream) => Ok(stream),
        Err(first) => {
            warn!("media acquisition failed ({first}), retrying with fallback profile");
            devices.open_input(MediaProfile::FALLBACK, video, audio).await
        }
    }
}

/// Bookkeeping for the current local media: owned by the session actor,
/// mutated only between suspension points.
#[derive(Default)]
pub struct MediaManager {
    stream: LocalStream,
    saved_camera: Option<LocalTrack>,
    screen_sharing: bool,
    audio_enabled: bool,
    video_enabled: bool,
}

impl MediaManager {
    pub fn new() -> Self {
        Self {
            stream: LocalStream::default(),
            saved_camera: None,
            screen_sharing: false,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.stream.tracks
    }

    pub fn media_state(&self) -> (bool, bool, bool) {
        (self.audio_enabled, self.video_enabled, self.screen_sharing)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_sharing
    }

    /// Replace the tracked stream with a fresh acquisition. The caller
    /// re-attaches the new tracks onto established transports.
    pub fn replace_stream(&mut self, devices: &dyn MediaDevices, mut stream: LocalStream) {
        for track in stream.tracks.iter_mut() {
            track.enabled = match track.kind {
                TrackKind::Audio => self.audio_enabled,
                TrackKind::Video => self.video_enabled,
            };
        }
        self.release(devices);
        self.stream = stream;
    }

    /// Mute/unmute without renegotiation: only the flag changes.
    pub fn set_enabled(&mut self, kind: TrackKind, enabled: bool) {
        match kind {
            TrackKind::Audio => self.audio_enabled = enabled,
            TrackKind::Video => self.video_enabled = enabled,
        }
        for track in self.stream.tracks.iter_mut().filter(|t| t.kind == kind) {
            track.enabled = enabled;
        }
    }

    /// Swap the outbound video to the screen track, remembering the camera
    /// track for restore. Returns the screen track to push onto transports,
    /// or `None` if a share is already active.
    pub fn begin_screen_share(&mut self, screen: LocalTrack) -> Option<LocalTrack> {
        if self.screen_sharing {
            return None;
        }
        self.saved_camera = self
            .stream
            .tracks
            .iter()
            .position(|t| t.kind == TrackKind::Video && t.source == TrackSource::Camera)
            .map(|i| self.stream.tracks.remove(i));
        self.stream.tracks.push(screen.clone());
        self.screen_sharing = true;
        Some(screen)
    }

    /// End the share and restore the saved camera track, if any.
    pub fn end_screen_share(&mut self, devices: &dyn MediaDevices) -> Option<LocalTrack> {
        if !self.screen_sharing {
            return None;
        }
        self.screen_sharing = false;
        if let Some(i) = self
            .stream
            .tracks
            .iter()
            .position(|t| t.source == TrackSource::Screen)
        {
            let screen = self.stream.tracks.remove(i);
            devices.stop(&screen);
        }
        let camera = self.saved_camera.take();
        if let Some(cam) = camera.clone() {
            self.stream.tracks.push(cam);
        }
        camera
    }

    /// Stop and release everything. Idempotent.
    pub fn release(&mut self, devices: &dyn MediaDevices) {
        for track in self.stream.tracks.drain(..) {
            devices.stop(&track);
        }
        if let Some(cam) = self.saved_camera.take() {
            devices.stop(&cam);
        }
        self.screen_sharing = false;
    }
}
