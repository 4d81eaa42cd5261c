//! Trait seam over the negotiated per-peer media transport.
//!
//! The production implementation (`rtc::RtcFactory`) wraps an
//! RTCPeerConnection; tests drive the negotiation engine with scripted
//! doubles instead.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::media::{LocalTrack, RemoteStream, TrackKind};
use crate::peer::types::{CandidateInit, PeerId, SessionDescription};

/// Connectivity as reported by the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications pushed by a transport into the session
/// mailbox. Ordering relative to negotiation completions is not guaranteed.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// Snapshot of the remote stream after a new track arrived.
    RemoteTrack(RemoteStream),
    LocalCandidate(CandidateInit),
}

pub type TransportEventSender = mpsc::UnboundedSender<(PeerId, TransportEvent)>;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create and install a local offer. `ice_restart` requests an in-place
    /// connectivity restart on the existing session.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    /// Apply the remote answer to our outstanding offer.
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError>;

    /// Attach or refresh outbound tracks. Per kind: adds a sender when none
    /// exists, otherwise swaps the carried track in place. Never triggers a
    /// new offer by itself.
    async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<(), TransportError>;

    /// Swap the outbound video leg's carried track without renegotiation
    /// (camera ↔ screen share).
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Mute/unmute an outbound kind. Never renegotiates.
    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool);

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport for one remote peer. Events are delivered through
    /// `events`, tagged with the peer id.
    async fn create(
        &self,
        peer: &PeerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
