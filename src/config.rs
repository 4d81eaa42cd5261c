use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::media::MediaProfile;
use crate::peer::Identity;

/// How long a disconnected peer may stay in the table before it is treated
/// as departed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// ICE server entry as configured by the embedder.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun-0".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Desktop,
    Mobile,
}

/// Coarse network-quality hint, when one is obtainable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    Good,
    Constrained,
}

/// Per-session configuration. One `MeshConfig` per joined meeting.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub meeting_id: String,
    pub identity: Identity,
    pub ice_servers: Vec<ServerConfig>,
    pub grace_period: Duration,
    pub device_class: DeviceClass,
    pub network_hint: Option<NetworkQuality>,
}

impl MeshConfig {
    pub fn new(meeting_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            identity: Identity::generate(display_name),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            grace_period: DEFAULT_GRACE_PERIOD,
            device_class: DeviceClass::Desktop,
            network_hint: None,
        }
    }

    /// Capture profile for the first acquisition attempt, picked from the
    /// device class and the network hint. The fallback profile used for the
    /// one retry is fixed and independent of this choice.
    pub fn capture_profile(&self) -> MediaProfile {
        if self.network_hint == Some(NetworkQuality::Constrained) {
            return MediaProfile::CONSTRAINED;
        }
        match self.device_class {
            DeviceClass::Desktop => MediaProfile::DESKTOP,
            DeviceClass::Mobile => MediaProfile::MOBILE,
        }
    }
}
