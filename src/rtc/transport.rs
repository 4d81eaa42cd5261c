//! RTCPeerConnection-backed transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::config::{MeshConfig, ServerConfig};
use crate::error::TransportError;
use crate::media::{RemoteStream, RemoteTrack, TrackKind};
use crate::peer::{
    CandidateInit, PeerId, PeerTransport, SdpKind, SessionDescription, TransportEvent,
    TransportEventSender, TransportFactory, TransportState,
};
use crate::rtc::media::TrackRegistry;
use crate::utils::add_ice_url_scheme;

fn sdp_err(e: webrtc::Error) -> TransportError {
    TransportError::Sdp(e.to_string())
}

pub struct RtcFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    registry: Arc<TrackRegistry>,
}

impl RtcFactory {
    pub fn new(cfg: &MeshConfig, registry: Arc<TrackRegistry>) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        Ok(Self {
            api,
            ice_servers: ice_servers(&cfg.ice_servers),
            registry,
        })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[async_trait]
impl TransportFactory for RtcFactory {
    async fn create(
        &self,
        peer: &PeerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config())
                .await
                .map_err(|e| TransportError::Backend(e.to_string()))?,
        );

        // Trickle ICE: forward each local candidate the moment it appears.
        {
            let events = events.clone();
            let peer = peer.clone();
            pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                if let Some(c) = cand {
                    match c.to_json() {
                        Ok(init) => {
                            let _ = events.send((
                                peer.clone(),
                                TransportEvent::LocalCandidate(CandidateInit {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                }),
                            ));
                        }
                        Err(e) => warn!("serializing local candidate failed: {e}"),
                    }
                } else {
                    debug!("ice candidate gathering completed");
                }
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            let peer = peer.clone();
            pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let state = match st {
                    RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                    RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                    RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    let _ = events.send((peer.clone(), TransportEvent::StateChanged(state)));
                }
                Box::pin(async {})
            }));
        }

        // Accumulate inbound tracks into one stream snapshot per peer and
        // re-publish it on every arrival.
        {
            let peer = peer.clone();
            let received: Arc<Mutex<RemoteStream>> = Arc::new(Mutex::new(RemoteStream::default()));
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                let snapshot = {
                    let mut stream = received.lock().unwrap();
                    if stream.id.is_empty() {
                        stream.id = track.stream_id();
                    }
                    stream.tracks.push(RemoteTrack {
                        id: track.id(),
                        kind,
                    });
                    stream.clone()
                };
                let _ = events.send((peer.clone(), TransportEvent::RemoteTrack(snapshot)));
                Box::pin(async {})
            }));
        }

        Ok(Arc::new(RtcTransport {
            pc,
            registry: self.registry.clone(),
            senders: tokio::sync::Mutex::new(HashMap::new()),
        }))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    registry: Arc<TrackRegistry>,
    senders: tokio::sync::Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

impl RtcTransport {
    async fn install(
        &self,
        kind: TrackKind,
        local: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), TransportError> {
        let mut senders = self.senders.lock().await;
        match senders.get(&kind) {
            Some(sender) => sender
                .replace_track(Some(local))
                .await
                .map_err(|e| TransportError::Track(e.to_string())),
            None => {
                let sender = self
                    .pc
                    .add_track(local)
                    .await
                    .map_err(|e| TransportError::Track(e.to_string()))?;
                senders.insert(kind, sender);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(sdp_err)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(sdp_err)?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let remote = RTCSessionDescription::offer(offer.sdp).map_err(sdp_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(sdp_err)?;
        let answer = self.pc.create_answer(None).await.map_err(sdp_err)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(sdp_err)?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        let remote = RTCSessionDescription::answer(answer.sdp).map_err(sdp_err)?;
        self.pc.set_remote_description(remote).await.map_err(sdp_err)
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| TransportError::Ice(e.to_string()))
    }

    async fn attach_tracks(
        &self,
        tracks: &[crate::media::LocalTrack],
    ) -> Result<(), TransportError> {
        for track in tracks {
            let Some(registered) = self.registry.get(&track.id) else {
                warn!("track {} not registered with the media backend", track.id);
                continue;
            };
            self.install(track.kind, registered.local()).await?;
        }
        Ok(())
    }

    async fn replace_video_track(
        &self,
        track: &crate::media::LocalTrack,
    ) -> Result<(), TransportError> {
        let registered = self
            .registry
            .get(&track.id)
            .ok_or_else(|| TransportError::Track(format!("unregistered track {}", track.id)))?;
        self.install(TrackKind::Video, registered.local()).await
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        // Muting is applied at the sample source: writers drop frames for
        // disabled kinds, the sender and its track stay in place.
        self.registry.set_enabled(kind, enabled);
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("closing peer connection: {e}");
        }
    }
}
