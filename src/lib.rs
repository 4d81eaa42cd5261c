//! meshcall: the peer-connection/signaling core of a full-mesh video call.
//!
//! One [`MeshSession`] per joined meeting drives offer/answer/ICE exchange
//! with every remote participant over a best-effort broadcast
//! [`SignalingChannel`], keeps the authoritative peer table, and reports
//! streams, departures, and media state through the [`MeshEvents`] hooks.
//! The `rtc` module supplies the production transport on the `webrtc`
//! crate; the trait seams keep the negotiation logic testable without a
//! network.

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod signaling;
mod utils;

pub use config::{DeviceClass, MeshConfig, NetworkQuality, ServerConfig};
pub use error::{MediaError, MeshError, SignalingError, TransportError};
pub use events::{MeshEvents, NullEvents};
pub use media::{
    LocalStream, LocalTrack, MediaDevices, MediaProfile, RemoteStream, RemoteTrack, ScreenCapture,
    TrackKind, TrackSource,
};
pub use peer::{
    CandidateInit, Identity, ParticipantInfo, PeerId, PeerPhase, PeerTransport, SdpKind,
    SessionDescription, TransportEvent, TransportEventSender, TransportFactory, TransportState,
};
pub use session::{AdmissionGate, MeshSession, OpenAdmission};
pub use signaling::{LocalChannel, LocalHub, SignalBody, SignalMessage, SignalingChannel};
