//! One meeting session: the public handle plus the actor that owns the
//! peer table and drives negotiation across the mesh.
//!
//! All state lives in one task. Signaling inbound, transport callbacks,
//! grace timers, and UI commands are funneled into the same mailbox, so
//! mutations never race. Slow operations (media acquisition, offer/answer
//! creation) run in spawned tasks that post completions back; every
//! completion re-validates that the peer record still exists and carries
//! the same epoch, since the peer may have left in the meantime.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::config::MeshConfig;
use crate::error::{MediaError, MeshError, TransportError};
use crate::events::MeshEvents;
use crate::media::{
    self, LocalStream, LocalTrack, MediaDevices, MediaManager, ScreenCapture, TrackKind,
};
use crate::peer::{
    CandidateInit, Identity, ParticipantInfo, PeerId, PeerPhase, PeerRecord, PeerTable,
    SessionDescription, TransportEvent, TransportFactory, TransportState,
};
use crate::signaling::{decode_signal, SignalBody, SignalMessage, SignalingChannel};

/// Boolean admission gate over the external waiting-room collaborator.
/// Consulted once, before the join announcement goes out.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn admitted(&self, participant: &PeerId) -> bool;
}

/// Admits everyone. The default for meetings without a waiting room.
pub struct OpenAdmission;

#[async_trait]
impl AdmissionGate for OpenAdmission {
    async fn admitted(&self, _participant: &PeerId) -> bool {
        true
    }
}

type Reply = oneshot::Sender<Result<(), MeshError>>;

enum Command {
    InitMedia {
        video: bool,
        audio: bool,
        reply: Reply,
    },
    StartScreenShare {
        reply: Reply,
    },
    Join {
        reply: Reply,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    ToggleAudio(bool),
    ToggleVideo(bool),
    RaiseHand(bool),
    ParticipantCount {
        reply: oneshot::Sender<usize>,
    },
    Participants {
        reply: oneshot::Sender<Vec<ParticipantInfo>>,
    },
}

enum Internal {
    Admitted {
        ok: bool,
        reply: Reply,
    },
    MediaReady {
        stream: LocalStream,
        reply: Reply,
    },
    ScreenReady {
        capture: ScreenCapture,
        reply: Reply,
    },
    ScreenEnded,
    OfferReady {
        peer: PeerId,
        epoch: u64,
        restart: bool,
        sdp: Result<SessionDescription, TransportError>,
    },
    AnswerReady {
        peer: PeerId,
        epoch: u64,
        sdp: Result<SessionDescription, TransportError>,
    },
    AnswerApplied {
        peer: PeerId,
        epoch: u64,
        result: Result<(), TransportError>,
    },
    GraceElapsed {
        peer: PeerId,
        epoch: u64,
    },
}

/// Handle to a running meeting session. Cheap to clone; dropping every
/// handle shuts the session down.
#[derive(Clone)]
pub struct MeshSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    local: Identity,
}

impl MeshSession {
    /// Start the session actor. The signaling subscription begins here; the
    /// join announcement only goes out on `join_meeting`.
    pub fn spawn(
        cfg: MeshConfig,
        channel: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn TransportFactory>,
        events: Arc<dyn MeshEvents>,
        admission: Arc<dyn AdmissionGate>,
    ) -> MeshSession {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let sig_rx = channel.subscribe();
        let local = cfg.identity.clone();

        let engine = Engine {
            local: local.clone(),
            grace_period: cfg.grace_period,
            capture_profile: cfg.capture_profile(),
            channel,
            devices,
            factory,
            events,
            admission,
            table: PeerTable::new(local.id.clone()),
            media: MediaManager::new(),
            hand_raised: false,
            joined: false,
            internal_tx,
            transport_tx,
        };
        tokio::spawn(engine.run(cmd_rx, sig_rx, transport_rx, internal_rx));

        MeshSession { cmd_tx, local }
    }

    pub fn identity(&self) -> &Identity {
        &self.local
    }

    /// Acquire camera/microphone. Fatal acquisition failure (after the one
    /// fallback retry) propagates here so the UI can abort the join flow.
    pub async fn initialize_media(&self, video: bool, audio: bool) -> Result<(), MeshError> {
        self.request(|reply| Command::InitMedia { video, audio, reply })
            .await
    }

    pub async fn start_screen_share(&self) -> Result<(), MeshError> {
        self.request(|reply| Command::StartScreenShare { reply }).await
    }

    /// Consult the admission gate and announce presence to the meeting.
    pub async fn join_meeting(&self) -> Result<(), MeshError> {
        self.request(|reply| Command::Join { reply }).await
    }

    /// Announce departure, tear down every transport, and stop the actor.
    pub async fn leave_meeting(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Leave { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn toggle_audio(&self, enabled: bool) {
        let _ = self.cmd_tx.send(Command::ToggleAudio(enabled));
    }

    pub fn toggle_video(&self, enabled: bool) {
        let _ = self.cmd_tx.send(Command::ToggleVideo(enabled));
    }

    pub fn raise_hand(&self, raised: bool) {
        let _ = self.cmd_tx.send(Command::RaiseHand(raised));
    }

    pub async fn participant_count(&self) -> Result<usize, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ParticipantCount { reply })
            .map_err(|_| MeshError::SessionClosed)?;
        rx.await.map_err(|_| MeshError::SessionClosed)
    }

    pub async fn participants(&self) -> Result<Vec<ParticipantInfo>, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Participants { reply })
            .map_err(|_| MeshError::SessionClosed)?;
        rx.await.map_err(|_| MeshError::SessionClosed)
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply) -> Command,
    ) -> Result<(), MeshError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .map_err(|_| MeshError::SessionClosed)?;
        rx.await.map_err(|_| MeshError::SessionClosed)?
    }
}

struct Engine {
    local: Identity,
    grace_period: std::time::Duration,
    capture_profile: crate::media::MediaProfile,
    channel: Arc<dyn SignalingChannel>,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn TransportFactory>,
    events: Arc<dyn MeshEvents>,
    admission: Arc<dyn AdmissionGate>,
    table: PeerTable,
    media: MediaManager,
    hand_raised: bool,
    joined: bool,
    internal_tx: mpsc::UnboundedSender<Internal>,
    transport_tx: mpsc::UnboundedSender<(PeerId, TransportEvent)>,
}

impl Engine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut sig_rx: mpsc::UnboundedReceiver<serde_json::Value>,
        mut transport_rx: mpsc::UnboundedReceiver<(PeerId, TransportEvent)>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    // Every handle dropped: tear down like a leave.
                    None => break,
                },
                Some(raw) = sig_rx.recv() => match decode_signal(raw) {
                    Ok(msg) => self.handle_signal(msg).await,
                    Err(e) => warn!("dropping undecodable signaling payload: {e}"),
                },
                Some((peer, ev)) = transport_rx.recv() => self.handle_transport(peer, ev),
                Some(msg) = internal_rx.recv() => self.handle_internal(msg).await,
            }
        }
        self.shutdown();
    }

    // ---------- commands ----------

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::InitMedia { video, audio, reply } => {
                let devices = self.devices.clone();
                let profile = self.capture_profile;
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    match media::acquire(&*devices, profile, video, audio).await {
                        Ok(stream) => {
                            let _ = tx.send(Internal::MediaReady { stream, reply });
                        }
                        Err(e) => {
                            error!("media acquisition exhausted fallback: {e}");
                            let _ = reply.send(Err(MeshError::Media(e)));
                        }
                    }
                });
            }
            Command::StartScreenShare { reply } => {
                if self.media.is_screen_sharing() {
                    let _ = reply.send(Ok(()));
                    return false;
                }
                let devices = self.devices.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    match devices.open_screen().await {
                        Ok(capture) => {
                            let _ = tx.send(Internal::ScreenReady { capture, reply });
                        }
                        Err(e) => {
                            let _ = reply.send(Err(MeshError::Media(e)));
                        }
                    }
                });
            }
            Command::Join { reply } => {
                if self.joined {
                    let _ = reply.send(Ok(()));
                    return false;
                }
                let gate = self.admission.clone();
                let id = self.local.id.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let ok = gate.admitted(&id).await;
                    let _ = tx.send(Internal::Admitted { ok, reply });
                });
            }
            Command::Leave { reply } => {
                let _ = reply.send(());
                return true;
            }
            Command::ToggleAudio(enabled) => self.set_local_enabled(TrackKind::Audio, enabled),
            Command::ToggleVideo(enabled) => self.set_local_enabled(TrackKind::Video, enabled),
            Command::RaiseHand(raised) => {
                self.hand_raised = raised;
                self.publish(
                    None,
                    SignalBody::HandRaise {
                        name: self.local.name.clone(),
                        raised,
                    },
                );
            }
            Command::ParticipantCount { reply } => {
                let _ = reply.send(self.table.participant_count());
            }
            Command::Participants { reply } => {
                let _ = reply.send(self.table.participants());
            }
        }
        false
    }

    /// Mute/unmute: flag flip plus a media-state broadcast, never an
    /// offer/answer cycle.
    fn set_local_enabled(&mut self, kind: TrackKind, enabled: bool) {
        self.media.set_enabled(kind, enabled);
        for (_, rec) in self.table.iter_mut() {
            if rec.phase.is_live() {
                let transport = rec.transport.clone();
                tokio::spawn(async move {
                    transport.set_track_enabled(kind, enabled).await;
                });
            }
        }
        self.broadcast_media_state();
    }

    // ---------- inbound signaling ----------

    async fn handle_signal(&mut self, msg: SignalMessage) {
        if msg.sender == self.local.id {
            return;
        }
        if let Some(target) = &msg.target {
            if *target != self.local.id {
                return;
            }
        }
        if !self.joined {
            return;
        }
        let sender = msg.sender;
        match msg.body {
            SignalBody::PresenceAnnounce {
                name,
                audio_enabled,
                video_enabled,
                screen_sharing,
            } => {
                self.on_presence_announce(sender, name, audio_enabled, video_enabled, screen_sharing)
                    .await
            }
            SignalBody::PresenceLeave => {
                debug!("peer {sender} announced leave");
                self.close_peer(&sender);
            }
            SignalBody::Offer { sdp } => self.on_offer(sender, sdp).await,
            SignalBody::Answer { sdp } => self.on_answer(sender, sdp),
            SignalBody::IceCandidate { candidate } => self.on_candidate(sender, candidate),
            SignalBody::MediaState {
                audio_enabled,
                video_enabled,
                screen_sharing,
            } => {
                if let Some(rec) = self.table.get_mut(&sender) {
                    rec.audio_enabled = audio_enabled;
                    rec.video_enabled = video_enabled;
                    rec.screen_sharing = screen_sharing;
                    self.events
                        .on_media_state(&sender, audio_enabled, video_enabled, screen_sharing);
                } else {
                    debug!("media-state from unknown peer {sender}, ignoring");
                }
            }
            // Hand-raise is presence-level: accepted even from peers whose
            // transport is not up yet.
            SignalBody::HandRaise { name, raised } => {
                self.events.on_hand_raised(&sender, &name, raised);
            }
        }
    }

    async fn on_presence_announce(
        &mut self,
        sender: PeerId,
        name: String,
        audio_enabled: bool,
        video_enabled: bool,
        screen_sharing: bool,
    ) {
        if let Some(rec) = self.table.get_mut(&sender) {
            // Duplicate announce: idempotent, no second record, no second
            // offer. Fold any state the announce carries.
            rec.name = name;
            let changed = (rec.audio_enabled, rec.video_enabled, rec.screen_sharing)
                != (audio_enabled, video_enabled, screen_sharing);
            rec.audio_enabled = audio_enabled;
            rec.video_enabled = video_enabled;
            rec.screen_sharing = screen_sharing;
            if changed {
                self.events
                    .on_media_state(&sender, audio_enabled, video_enabled, screen_sharing);
            }
            return;
        }

        // Existing members initiate toward the newcomer.
        info!("peer {sender} ({name}) joined, initiating offer");
        let Some(()) = self.create_record(&sender, name).await else {
            return;
        };
        if let Some(rec) = self.table.get_mut(&sender) {
            rec.audio_enabled = audio_enabled;
            rec.video_enabled = video_enabled;
            rec.screen_sharing = screen_sharing;
        }
        self.start_offer(&sender, false);
    }

    async fn on_offer(&mut self, sender: PeerId, sdp: SessionDescription) {
        if !self.table.contains(&sender) {
            // Inbound offer from an unknown peer creates the record in the
            // same step.
            info!("inbound offer from new peer {sender}");
            let Some(()) = self.create_record(&sender, String::new()).await else {
                return;
            };
            self.start_answer(&sender, sdp);
            return;
        }

        let phase = match self.table.get_mut(&sender) {
            Some(rec) => rec.phase,
            None => return,
        };
        match phase {
            PeerPhase::Offering => {
                // Glare: both sides offered at once. Lexicographic
                // tie-break on the identities; the greater id keeps its
                // offer, the smaller discards its attempt and answers.
                if self.local.id.0 > sender.0 {
                    debug!("glare with {sender}: keeping our offer, ignoring theirs");
                    return;
                }
                debug!("glare with {sender}: yielding, answering their offer");
                if !self.reset_transport(&sender).await {
                    return;
                }
                if let Some(rec) = self.table.get_mut(&sender) {
                    rec.advance(&sender, PeerPhase::Answering);
                }
                self.start_answer(&sender, sdp);
            }
            PeerPhase::New => {
                if let Some(rec) = self.table.get_mut(&sender) {
                    rec.advance(&sender, PeerPhase::Answering);
                }
                self.start_answer(&sender, sdp);
            }
            // Renegotiation on a live session, e.g. a remote connectivity
            // restart. Answer on the existing transport, phase unchanged.
            _ => self.start_answer(&sender, sdp),
        }
    }

    fn on_answer(&mut self, sender: PeerId, sdp: SessionDescription) {
        let Some(rec) = self.table.get_mut(&sender) else {
            debug!("answer from unknown peer {sender}, ignoring");
            return;
        };
        let transport = rec.transport.clone();
        let epoch = rec.epoch;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.apply_answer(sdp).await;
            let _ = tx.send(Internal::AnswerApplied {
                peer: sender,
                epoch,
                result,
            });
        });
    }

    fn on_candidate(&mut self, sender: PeerId, candidate: CandidateInit) {
        let Some(rec) = self.table.get_mut(&sender) else {
            debug!("ice candidate from unknown peer {sender}, ignoring");
            return;
        };
        if rec.remote_description_set {
            let transport = rec.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.add_remote_candidate(candidate).await {
                    warn!("failed to add ice candidate from {sender}: {e}");
                }
            });
        } else {
            // Candidates can outrun the offer/answer; queue until the
            // remote description is in place.
            rec.pending_candidates.push(candidate);
        }
    }

    // ---------- transport events ----------

    fn handle_transport(&mut self, peer: PeerId, ev: TransportEvent) {
        match ev {
            TransportEvent::StateChanged(state) => self.on_transport_state(peer, state),
            TransportEvent::RemoteTrack(stream) => {
                // Stream availability is reported the moment a track
                // arrives, regardless of connection state.
                if let Some(rec) = self.table.get_mut(&peer) {
                    rec.stream = Some(stream.clone());
                    self.events.on_stream_available(
                        &peer,
                        &stream,
                        &rec.name,
                        rec.audio_enabled,
                        rec.video_enabled,
                    );
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                if self.table.contains(&peer) {
                    self.publish(Some(peer), SignalBody::IceCandidate { candidate });
                }
            }
        }
    }

    fn on_transport_state(&mut self, peer: PeerId, state: TransportState) {
        match state {
            TransportState::Connecting => {
                if let Some(rec) = self.table.get_mut(&peer) {
                    if matches!(rec.phase, PeerPhase::Offering | PeerPhase::Answering) {
                        rec.advance(&peer, PeerPhase::Connecting);
                    }
                }
            }
            TransportState::Connected => {
                if let Some(rec) = self.table.get_mut(&peer) {
                    rec.cancel_grace();
                    if matches!(rec.phase, PeerPhase::Offering | PeerPhase::Answering) {
                        rec.advance(&peer, PeerPhase::Connecting);
                    }
                    if rec.advance(&peer, PeerPhase::Connected) {
                        info!("peer {peer} connected");
                    }
                }
            }
            TransportState::Disconnected => {
                let grace = self.grace_period;
                let tx = self.internal_tx.clone();
                if let Some(rec) = self.table.get_mut(&peer) {
                    if rec.grace.is_some() {
                        return;
                    }
                    if matches!(rec.phase, PeerPhase::Offering | PeerPhase::Answering) {
                        rec.advance(&peer, PeerPhase::Connecting);
                    }
                    if !rec.advance(&peer, PeerPhase::Disconnected) {
                        return;
                    }
                    info!("peer {peer} disconnected, grace period {grace:?} started");
                    let epoch = rec.epoch;
                    let p = peer.clone();
                    rec.grace = Some(tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        let _ = tx.send(Internal::GraceElapsed { peer: p, epoch });
                    }));
                }
            }
            TransportState::Failed => {
                // No terminal failed state: attempt an in-place
                // connectivity restart before any grace path.
                if self.table.contains(&peer) {
                    warn!("transport for {peer} failed, attempting connectivity restart");
                    self.start_offer(&peer, true);
                }
            }
            TransportState::Closed => {
                self.close_peer(&peer);
            }
        }
    }

    // ---------- internal completions ----------

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Admitted { ok, reply } => {
                if !ok {
                    let _ = reply.send(Err(MeshError::NotAdmitted));
                    return;
                }
                self.joined = true;
                let (audio, video, screen) = self.media.media_state();
                self.publish(
                    None,
                    SignalBody::PresenceAnnounce {
                        name: self.local.name.clone(),
                        audio_enabled: audio,
                        video_enabled: video,
                        screen_sharing: screen,
                    },
                );
                self.events
                    .on_participant_count(self.table.participant_count());
                info!("joined meeting as {} ({})", self.local.id, self.local.name);
                let _ = reply.send(Ok(()));
            }
            Internal::MediaReady { stream, reply } => {
                self.media.replace_stream(&*self.devices, stream);
                let tracks = self.media.tracks().to_vec();
                // Re-attach onto every established transport; peers that
                // need nothing new are left undisturbed by the per-kind
                // replace semantics of attach_tracks.
                for (peer, rec) in self.table.iter_mut() {
                    if rec.phase.is_live() {
                        let transport = rec.transport.clone();
                        let tracks = tracks.clone();
                        let peer = peer.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transport.attach_tracks(&tracks).await {
                                warn!("re-attaching tracks for {peer} failed: {e}");
                            }
                        });
                    }
                }
                if self.joined {
                    self.broadcast_media_state();
                }
                let _ = reply.send(Ok(()));
            }
            Internal::ScreenReady { capture, reply } => {
                let Some(screen) = capture.stream.video().cloned() else {
                    let _ = reply.send(Err(MeshError::Media(MediaError::Backend(
                        "screen capture produced no video track".into(),
                    ))));
                    return;
                };
                if self.media.begin_screen_share(screen.clone()).is_none() {
                    // A share raced in ahead of this one; drop the capture.
                    for track in &capture.stream.tracks {
                        self.devices.stop(track);
                    }
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.swap_video_track(screen);
                self.broadcast_media_state();
                // Watch for the externally triggered capture end (the
                // user's native stop-sharing control).
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    if capture.ended.await.is_ok() {
                        let _ = tx.send(Internal::ScreenEnded);
                    }
                });
                let _ = reply.send(Ok(()));
            }
            Internal::ScreenEnded => {
                if !self.media.is_screen_sharing() {
                    return;
                }
                if let Some(camera) = self.media.end_screen_share(&*self.devices) {
                    info!("screen capture ended, restoring camera track");
                    self.swap_video_track(camera);
                }
                self.broadcast_media_state();
            }
            Internal::OfferReady {
                peer,
                epoch,
                restart,
                sdp,
            } => {
                let Some(rec) = self.validate(&peer, epoch) else {
                    return;
                };
                match sdp {
                    Ok(sdp) => {
                        if restart || rec.phase == PeerPhase::Offering {
                            self.publish(Some(peer), SignalBody::Offer { sdp });
                        }
                    }
                    Err(e) => warn!("offer creation for {peer} failed: {e}"),
                }
            }
            Internal::AnswerReady { peer, epoch, sdp } => {
                let Some(rec) = self.validate(&peer, epoch) else {
                    return;
                };
                match sdp {
                    Ok(sdp) => {
                        rec.remote_description_set = true;
                        if rec.phase == PeerPhase::Answering {
                            rec.advance(&peer, PeerPhase::Connecting);
                        }
                        self.flush_pending_candidates(&peer);
                        self.publish(Some(peer), SignalBody::Answer { sdp });
                    }
                    Err(e) => warn!("answering offer from {peer} failed: {e}"),
                }
            }
            Internal::AnswerApplied {
                peer,
                epoch,
                result,
            } => {
                let Some(rec) = self.validate(&peer, epoch) else {
                    return;
                };
                match result {
                    Ok(()) => {
                        rec.remote_description_set = true;
                        if rec.phase == PeerPhase::Offering {
                            rec.advance(&peer, PeerPhase::Connecting);
                        }
                        self.flush_pending_candidates(&peer);
                    }
                    Err(e) => warn!("applying answer from {peer} failed: {e}"),
                }
            }
            Internal::GraceElapsed { peer, epoch } => {
                let still_disconnected = self
                    .validate(&peer, epoch)
                    .map(|rec| rec.phase == PeerPhase::Disconnected)
                    .unwrap_or(false);
                if still_disconnected {
                    // Normal departure, not an error.
                    info!("peer {peer} did not recover within grace, removing");
                    self.close_peer(&peer);
                }
            }
        }
    }

    // ---------- helpers ----------

    /// Create transport and record for a newly seen peer. `None` when the
    /// transport could not be created or the record already exists.
    async fn create_record(&mut self, peer: &PeerId, name: String) -> Option<()> {
        let transport = match self.factory.create(peer, self.transport_tx.clone()).await {
            Ok(t) => t,
            Err(e) => {
                error!("creating transport for {peer} failed: {e}");
                return None;
            }
        };
        if !self.table.insert(peer.clone(), PeerRecord::new(name, transport)) {
            return None;
        }
        self.events
            .on_participant_count(self.table.participant_count());
        Some(())
    }

    /// Replace a record's transport with a fresh one (glare yield). The
    /// in-flight work against the old transport is invalidated by the epoch
    /// bump.
    async fn reset_transport(&mut self, peer: &PeerId) -> bool {
        let fresh = match self.factory.create(peer, self.transport_tx.clone()).await {
            Ok(t) => t,
            Err(e) => {
                error!("recreating transport for {peer} failed: {e}");
                return false;
            }
        };
        let Some(rec) = self.table.get_mut(peer) else {
            return false;
        };
        rec.epoch += 1;
        let old = std::mem::replace(&mut rec.transport, fresh);
        rec.remote_description_set = false;
        tokio::spawn(async move {
            old.close().await;
        });
        true
    }

    /// Attach current local tracks and create an offer, off-loop. Tracks go
    /// on before the offer is created so the offer already advertises them.
    fn start_offer(&mut self, peer: &PeerId, restart: bool) {
        let Some(rec) = self.table.get_mut(peer) else {
            return;
        };
        if !restart {
            rec.advance(peer, PeerPhase::Offering);
        }
        let transport = rec.transport.clone();
        let epoch = rec.epoch;
        let tracks = self.media.tracks().to_vec();
        let tx = self.internal_tx.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            if !restart {
                if let Err(e) = transport.attach_tracks(&tracks).await {
                    warn!("attaching tracks for {peer} failed: {e}");
                }
            }
            let sdp = transport.create_offer(restart).await;
            let _ = tx.send(Internal::OfferReady {
                peer,
                epoch,
                restart,
                sdp,
            });
        });
    }

    fn start_answer(&mut self, peer: &PeerId, offer: SessionDescription) {
        let Some(rec) = self.table.get_mut(peer) else {
            return;
        };
        if rec.phase == PeerPhase::New {
            rec.advance(peer, PeerPhase::Answering);
        }
        let transport = rec.transport.clone();
        let epoch = rec.epoch;
        let tracks = self.media.tracks().to_vec();
        let tx = self.internal_tx.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.attach_tracks(&tracks).await {
                warn!("attaching tracks for {peer} failed: {e}");
            }
            let sdp = transport.accept_offer(offer).await;
            let _ = tx.send(Internal::AnswerReady { peer, epoch, sdp });
        });
    }

    fn flush_pending_candidates(&mut self, peer: &PeerId) {
        let Some(rec) = self.table.get_mut(peer) else {
            return;
        };
        let queued = std::mem::take(&mut rec.pending_candidates);
        if queued.is_empty() {
            return;
        }
        let transport = rec.transport.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            for candidate in queued {
                if let Err(e) = transport.add_remote_candidate(candidate).await {
                    warn!("applying queued candidate from {peer} failed: {e}");
                }
            }
        });
    }

    fn swap_video_track(&mut self, track: LocalTrack) {
        for (peer, rec) in self.table.iter_mut() {
            if rec.phase.is_live() {
                let transport = rec.transport.clone();
                let track = track.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.replace_video_track(&track).await {
                        warn!("replacing video track for {peer} failed: {e}");
                    }
                });
            }
        }
    }

    fn validate(&mut self, peer: &PeerId, epoch: u64) -> Option<&mut PeerRecord> {
        match self.table.get_mut(peer) {
            Some(rec) if rec.epoch == epoch => Some(rec),
            Some(_) => {
                debug!("stale completion for {peer}, dropping");
                None
            }
            None => {
                debug!("completion for departed peer {peer}, dropping");
                None
            }
        }
    }

    /// Destroy the record and notify, exactly once per peer lifetime.
    fn close_peer(&mut self, peer: &PeerId) {
        if let Some(mut rec) = self.table.remove(peer) {
            rec.cancel_grace();
            rec.phase = PeerPhase::Closed;
            let transport = rec.transport.clone();
            tokio::spawn(async move {
                transport.close().await;
            });
            self.events.on_peer_left(peer);
            self.events
                .on_participant_count(self.table.participant_count());
        }
    }

    fn broadcast_media_state(&self) {
        if !self.joined {
            return;
        }
        let (audio_enabled, video_enabled, screen_sharing) = self.media.media_state();
        self.publish(
            None,
            SignalBody::MediaState {
                audio_enabled,
                video_enabled,
                screen_sharing,
            },
        );
    }

    /// Fire-and-forget publish; failures are logged and the message is
    /// dropped, matching the channel's best-effort contract.
    fn publish(&self, target: Option<PeerId>, body: SignalBody) {
        let msg = SignalMessage::new(self.local.id.clone(), target, body);
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.publish(&msg).await {
                warn!("signaling send failed, message dropped: {e}");
            }
        });
    }

    fn shutdown(&mut self) {
        if self.joined {
            self.publish(None, SignalBody::PresenceLeave);
            self.joined = false;
        }
        for (peer, mut rec) in self.table.drain() {
            rec.cancel_grace();
            let transport = rec.transport.clone();
            tokio::spawn(async move {
                transport.close().await;
            });
            self.events.on_peer_left(&peer);
        }
        self.events
            .on_participant_count(self.table.participant_count());
        self.media.release(&*self.devices);
        info!("session {} shut down", self.local.id);
    }
}
