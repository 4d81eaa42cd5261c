//! The notification contract exposed to the embedding UI layer.

use crate::media::RemoteStream;
use crate::peer::PeerId;

/// Observer interface injected once at session construction.
///
/// `on_participant_count` and `on_media_state` report current truth at the
/// time of firing; `on_peer_left` and `on_hand_raised` are edge events.
/// All hooks are invoked from the session actor task and must not block.
pub trait MeshEvents: Send + Sync {
    /// A remote media stream became available. Fired the moment a track is
    /// received, which may be before or after the peer reports connected.
    fn on_stream_available(
        &self,
        peer: &PeerId,
        stream: &RemoteStream,
        name: &str,
        audio_enabled: bool,
        video_enabled: bool,
    ) {
        let _ = (peer, stream, name, audio_enabled, video_enabled);
    }

    fn on_peer_left(&self, peer: &PeerId) {
        let _ = peer;
    }

    /// Current participant count, local participant included.
    fn on_participant_count(&self, count: usize) {
        let _ = count;
    }

    fn on_media_state(
        &self,
        peer: &PeerId,
        audio_enabled: bool,
        video_enabled: bool,
        screen_sharing: bool,
    ) {
        let _ = (peer, audio_enabled, video_enabled, screen_sharing);
    }

    fn on_hand_raised(&self, peer: &PeerId, name: &str, raised: bool) {
        let _ = (peer, name, raised);
    }
}

/// Drops every notification. Useful for headless tooling and tests.
pub struct NullEvents;

impl MeshEvents for NullEvents {}
