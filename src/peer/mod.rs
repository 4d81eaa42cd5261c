pub mod state;
pub mod table;
pub mod transport;
pub mod types;

pub use state::PeerPhase;
pub use table::{PeerRecord, PeerTable};
pub use transport::{
    PeerTransport, TransportEvent, TransportEventSender, TransportFactory, TransportState,
};
pub use types::{CandidateInit, Identity, ParticipantInfo, PeerId, SdpKind, SessionDescription};
