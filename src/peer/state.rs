//! Per-peer negotiation state machine.
//!
//! `New → Offering | Answering → Connecting → Connected ⇄ Disconnected → Closed`
//!
//! There is no terminal `Failed` state: a failed transport gets an in-place
//! connectivity restart and, if that does not help, falls through the
//! disconnect-grace path like any other loss.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Record exists, negotiation not yet started.
    New,
    /// We initiated; our offer is out (or in flight).
    Offering,
    /// The remote initiated; we are producing the answer.
    Answering,
    /// Both descriptions set, connectivity establishment in progress.
    Connecting,
    Connected,
    /// Transient loss; a grace timer is running.
    Disconnected,
    Closed,
}

impl PeerPhase {
    pub fn can_transition(self, next: PeerPhase) -> bool {
        use PeerPhase::*;
        // Closing is legal from everywhere but Closed itself.
        if next == Closed {
            return self != Closed;
        }
        matches!(
            (self, next),
            (New, Offering)
                | (New, Answering)
                | (Offering, Connecting)
                // Glare yield: the losing offerer answers instead.
                | (Offering, Answering)
                | (Answering, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Connected)
        )
    }

    /// Whether local tracks can still be swapped/toggled on this peer.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            PeerPhase::Connecting | PeerPhase::Connected | PeerPhase::Disconnected
        )
    }
}

impl fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
