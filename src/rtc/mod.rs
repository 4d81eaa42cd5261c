//! Production backing for the transport and device seams, built on the
//! `webrtc` crate.

pub mod media;
pub mod transport;

use std::sync::Arc;

pub use media::{RtcMediaDevices, SampleWriter, TrackRegistry};
pub use transport::{RtcFactory, RtcTransport};

use crate::config::MeshConfig;
use crate::error::TransportError;

/// Build a matched factory/devices pair sharing one track registry.
pub fn stack(
    cfg: &MeshConfig,
) -> Result<(Arc<RtcFactory>, Arc<RtcMediaDevices>), TransportError> {
    let registry = Arc::new(TrackRegistry::default());
    let factory = Arc::new(RtcFactory::new(cfg, registry.clone())?);
    let devices = Arc::new(RtcMediaDevices::new(registry));
    Ok((factory, devices))
}
