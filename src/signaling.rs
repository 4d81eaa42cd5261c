//! Signaling channel abstraction: best-effort broadcast of negotiation and
//! presence messages, scoped to one meeting.
//!
//! The relay gives no ordering or delivery guarantee. Point-to-point
//! messages are still broadcast; non-target recipients ignore them. The
//! wire payload is JSON with a closed `kind` tag; unrecognized kinds are
//! dropped at the boundary, never crashed on.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::SignalingError;
use crate::peer::{CandidateInit, PeerId, SessionDescription};

/// Kind-specific payload of one signaling message.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalBody {
    PresenceAnnounce {
        name: String,
        audio_enabled: bool,
        video_enabled: bool,
        screen_sharing: bool,
    },
    PresenceLeave,
    Offer {
        sdp: SessionDescription,
    },
    Answer {
        sdp: SessionDescription,
    },
    IceCandidate {
        candidate: CandidateInit,
    },
    MediaState {
        audio_enabled: bool,
        video_enabled: bool,
        screen_sharing: bool,
    },
    HandRaise {
        name: String,
        raised: bool,
    },
}

/// Transient fire-and-forget envelope. No persistence, no retry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignalMessage {
    pub sender: PeerId,
    /// Broadcast when `None`; otherwise ignored by everyone but the target.
    pub target: Option<PeerId>,
    pub ts: i64,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl SignalMessage {
    pub fn new(sender: PeerId, target: Option<PeerId>, body: SignalBody) -> Self {
        Self {
            sender,
            target,
            ts: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }
}

/// Decode one raw relay payload. Unknown kinds and malformed envelopes come
/// back as `Err`; the caller logs and drops them.
pub fn decode_signal(raw: serde_json::Value) -> Result<SignalMessage, SignalingError> {
    Ok(serde_json::from_value(raw)?)
}

/// The external message relay, consumed, not designed, here.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Best-effort publish. A failure means the message is gone.
    async fn publish(&self, msg: &SignalMessage) -> Result<(), SignalingError>;

    /// Raw inbound payloads, in whatever order the relay delivers them.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<serde_json::Value>;
}

const HUB_CAPACITY: usize = 256;

/// In-process relay used by tests and demos: one broadcast channel per
/// meeting id, best effort like the real thing (lagging subscribers drop
/// messages).
#[derive(Default)]
pub struct LocalHub {
    rooms: Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, meeting_id: &str) -> LocalChannel {
        let mut rooms = self.rooms.lock().unwrap();
        let tx = rooms
            .entry(meeting_id.to_owned())
            .or_insert_with(|| broadcast::channel(HUB_CAPACITY).0)
            .clone();
        LocalChannel { tx }
    }
}

#[derive(Clone)]
pub struct LocalChannel {
    tx: broadcast::Sender<serde_json::Value>,
}

#[async_trait]
impl SignalingChannel for LocalChannel {
    async fn publish(&self, msg: &SignalMessage) -> Result<(), SignalingError> {
        let raw = serde_json::to_value(msg)?;
        // No subscribers is not a failure for a broadcast relay.
        let _ = self.tx.send(raw);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<serde_json::Value> {
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(raw) => {
                        if out_tx.send(raw).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("signaling subscriber lagged, dropped {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        out_rx
    }
}
