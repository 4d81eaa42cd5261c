//! Device backing for the webrtc stack: sample-fed local tracks.
//!
//! Native capture is the embedder's business; this module hands out
//! [`SampleWriter`]s wired to the `TrackLocalStaticSample`s that the
//! transports attach, so captured frames fan out to every peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{MediaError, TransportError};
use crate::media::{
    LocalStream, LocalTrack, MediaDevices, MediaProfile, ScreenCapture, TrackKind, TrackSource,
};

const LOCAL_STREAM_ID: &str = "meshcall-local";

#[derive(Clone)]
pub struct RegisteredTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl RegisteredTrack {
    pub fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

/// Shared between the factory and the device backend so transports can
/// resolve track ids to their sample sources.
#[derive(Default)]
pub struct TrackRegistry {
    inner: Mutex<HashMap<String, RegisteredTrack>>,
}

impl TrackRegistry {
    pub fn get(&self, id: &str) -> Option<RegisteredTrack> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for registered in self.inner.lock().unwrap().values() {
            if registered.kind == kind {
                registered.enabled.store(enabled, Ordering::Relaxed);
            }
        }
    }

    fn insert(&self, track: &LocalTrack) -> RegisteredTrack {
        let capability = match track.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let registered = RegisteredTrack {
            kind: track.kind,
            track: Arc::new(TrackLocalStaticSample::new(
                capability,
                track.id.clone(),
                LOCAL_STREAM_ID.to_owned(),
            )),
            enabled: Arc::new(AtomicBool::new(track.enabled)),
        };
        self.inner
            .lock()
            .unwrap()
            .insert(track.id.clone(), registered.clone());
        registered
    }

    fn remove(&self, id: &str) {
        self.inner.lock().unwrap().remove(id);
    }
}

/// Pushes captured frames into one local track. Cheap to clone.
#[derive(Clone)]
pub struct SampleWriter {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl SampleWriter {
    /// Write one encoded sample. Muted tracks swallow the sample so the
    /// transport keeps its sender without sending media.
    pub async fn write(&self, data: Bytes, duration: Duration) -> Result<(), TransportError> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Track(e.to_string()))
    }
}

/// `MediaDevices` implementation for the webrtc stack.
pub struct RtcMediaDevices {
    registry: Arc<TrackRegistry>,
    profile: Mutex<Option<MediaProfile>>,
    screen_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl RtcMediaDevices {
    pub fn new(registry: Arc<TrackRegistry>) -> Self {
        Self {
            registry,
            profile: Mutex::new(None),
            screen_stop: Mutex::new(None),
        }
    }

    /// The profile of the most recent acquisition, for the capture loop.
    pub fn capture_profile(&self) -> Option<MediaProfile> {
        *self.profile.lock().unwrap()
    }

    pub fn writer(&self, track: &LocalTrack) -> Option<SampleWriter> {
        self.registry.get(&track.id).map(|r| SampleWriter {
            track: r.track,
            enabled: r.enabled,
        })
    }

    /// Embedder hook for the platform's native "stop sharing" control.
    pub fn end_screen_capture(&self) {
        if let Some(stop) = self.screen_stop.lock().unwrap().take() {
            let _ = stop.send(());
        }
    }
}

#[async_trait]
impl MediaDevices for RtcMediaDevices {
    async fn open_input(
        &self,
        profile: MediaProfile,
        video: bool,
        audio: bool,
    ) -> Result<LocalStream, MediaError> {
        if !video && !audio {
            return Err(MediaError::NoDevice("nothing requested".into()));
        }
        *self.profile.lock().unwrap() = Some(profile);
        let mut tracks = Vec::new();
        if audio {
            let track = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone);
            self.registry.insert(&track);
            tracks.push(track);
        }
        if video {
            let track = LocalTrack::new(TrackKind::Video, TrackSource::Camera);
            self.registry.insert(&track);
            tracks.push(track);
        }
        Ok(LocalStream { tracks })
    }

    async fn open_screen(&self) -> Result<ScreenCapture, MediaError> {
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Screen);
        self.registry.insert(&track);
        let (stop_tx, ended) = oneshot::channel();
        *self.screen_stop.lock().unwrap() = Some(stop_tx);
        Ok(ScreenCapture {
            stream: LocalStream {
                tracks: vec![track],
            },
            ended,
        })
    }

    fn stop(&self, track: &LocalTrack) {
        self.registry.remove(&track.id);
        if track.source == TrackSource::Screen {
            // Dropping the pending stop sender; the capture is gone.
            self.screen_stop.lock().unwrap().take();
        }
    }
}
