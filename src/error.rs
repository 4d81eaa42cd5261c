use thiserror::Error;

/// Errors surfaced through the public session API.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Media acquisition failed after the fallback-profile retry. Fatal to
    /// the join attempt; the caller must abort the join flow.
    #[error("media acquisition failed: {0}")]
    Media(#[from] MediaError),

    #[error("signaling: {0}")]
    Signaling(#[from] SignalingError),

    /// The admission collaborator rejected this participant.
    #[error("not admitted to the meeting")]
    NotAdmitted,

    /// The session actor has already shut down (left the meeting).
    #[error("session closed")]
    SessionClosed,
}

/// Device-level acquisition failures.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("no capture device for {0}")]
    NoDevice(String),

    #[error("constraints unsatisfiable: {0}")]
    ConstraintsUnsatisfiable(String),

    #[error("media backend: {0}")]
    Backend(String),
}

/// Best-effort channel failures. Call sites log and drop the message; there
/// is no retry queue.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("send failed: {0}")]
    Send(String),

    #[error("undecodable payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures reported by a per-peer transport. Negotiation failures are
/// handled with an in-place connectivity restart, never a crash.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("sdp exchange failed: {0}")]
    Sdp(String),

    #[error("ice candidate rejected: {0}")]
    Ice(String),

    #[error("track operation failed: {0}")]
    Track(String),

    #[error("transport backend: {0}")]
    Backend(String),
}
