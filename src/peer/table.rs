//! The authoritative in-memory map from remote identity to negotiation
//! state. Single owner: the session actor. Every mutation goes through the
//! defined transitions and leaves the table consistent before yielding.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use tokio::task::JoinHandle;

use crate::media::RemoteStream;
use crate::peer::state::PeerPhase;
use crate::peer::transport::PeerTransport;
use crate::peer::types::{CandidateInit, ParticipantInfo, PeerId};

pub struct PeerRecord {
    pub name: String,
    pub phase: PeerPhase,
    pub transport: Arc<dyn PeerTransport>,
    pub stream: Option<RemoteStream>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    /// Remote description applied; candidates queue until then.
    pub remote_description_set: bool,
    pub pending_candidates: Vec<CandidateInit>,
    /// Bumped whenever in-flight negotiation work for this record is
    /// invalidated (glare yield, transport swap). Completions carrying a
    /// stale epoch are dropped.
    pub epoch: u64,
    pub grace: Option<JoinHandle<()>>,
}

impl PeerRecord {
    pub fn new(name: String, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            name,
            phase: PeerPhase::New,
            transport,
            stream: None,
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            epoch: 0,
            grace: None,
        }
    }

    /// Apply a transition, refusing illegal ones. Returns whether the
    /// transition happened.
    pub fn advance(&mut self, peer: &PeerId, next: PeerPhase) -> bool {
        if self.phase == next {
            return false;
        }
        if !self.phase.can_transition(next) {
            warn!("peer {peer}: refusing transition {} -> {}", self.phase, next);
            return false;
        }
        self.phase = next;
        true
    }

    pub fn cancel_grace(&mut self) {
        if let Some(handle) = self.grace.take() {
            handle.abort();
        }
    }
}

impl Drop for PeerRecord {
    fn drop(&mut self) {
        self.cancel_grace();
    }
}

pub struct PeerTable {
    local: PeerId,
    records: HashMap<PeerId, PeerRecord>,
}

impl PeerTable {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            records: HashMap::new(),
        }
    }

    /// Insert a record for `peer`. Refused for the local identity and for
    /// already-known peers, keeping join handling idempotent.
    pub fn insert(&mut self, peer: PeerId, record: PeerRecord) -> bool {
        if peer == self.local {
            warn!("refusing to create a peer record for the local participant");
            return false;
        }
        if self.records.contains_key(&peer) {
            return false;
        }
        self.records.insert(peer, record);
        true
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.records.contains_key(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerRecord> {
        self.records.get_mut(peer)
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerRecord> {
        self.records.remove(peer)
    }

    pub fn drain(&mut self) -> Vec<(PeerId, PeerRecord)> {
        self.records.drain().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PeerId, &mut PeerRecord)> {
        self.records.iter_mut()
    }

    /// Everyone in the call, the local participant included.
    pub fn participant_count(&self) -> usize {
        self.records.len() + 1
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.records
            .iter()
            .map(|(peer, rec)| ParticipantInfo {
                peer: peer.clone(),
                name: rec.name.clone(),
                phase: rec.phase,
                audio_enabled: rec.audio_enabled,
                video_enabled: rec.video_enabled,
                screen_sharing: rec.screen_sharing,
            })
            .collect()
    }
}
