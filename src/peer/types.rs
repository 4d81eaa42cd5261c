use std::fmt;

use serde::{Deserialize, Serialize};

use crate::peer::state::PeerPhase;
use crate::utils::random_id;

/// Opaque remote-participant identity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_owned())
    }
}

/// Local participant identity: opaque id plus display name.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Identity {
    pub id: PeerId,
    pub name: String,
}

impl Identity {
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            id: PeerId(random_id()),
            name: name.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description carried over the signaling channel.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// ICE candidate as relayed between peers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Snapshot of one remote participant, as exposed to the embedder.
#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub peer: PeerId,
    pub name: String,
    pub phase: PeerPhase,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}
