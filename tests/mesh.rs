//! End-to-end negotiation scenarios over the in-process hub, with scripted
//! transport and device doubles standing in for the webrtc stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::sleep;

use meshcall::signaling::decode_signal;
use meshcall::{
    AdmissionGate, CandidateInit, Identity, LocalStream, LocalTrack, MediaDevices, MediaError,
    MediaProfile, MeshConfig, MeshEvents, MeshSession, OpenAdmission, PeerId, PeerPhase,
    PeerTransport, RemoteStream, RemoteTrack, ScreenCapture, SessionDescription, SdpKind,
    SignalBody, SignalMessage, SignalingChannel, TrackKind, TrackSource, TransportError,
    TransportEvent, TransportEventSender, TransportFactory, TransportState,
};

// ---------- recording event surface ----------

#[derive(Clone, Debug, PartialEq)]
enum Ev {
    Stream(String),
    Left(String),
    Count(usize),
    Media {
        peer: String,
        audio: bool,
        video: bool,
        screen: bool,
    },
    Hand {
        peer: String,
        raised: bool,
    },
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Ev>>,
}

impl Recorder {
    fn all(&self) -> Vec<Ev> {
        self.events.lock().unwrap().clone()
    }

    fn lefts(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Ev::Left(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn counts(&self) -> Vec<usize> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Ev::Count(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn media_states(&self) -> Vec<(String, bool, bool, bool)> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Ev::Media {
                    peer,
                    audio,
                    video,
                    screen,
                } => Some((peer, audio, video, screen)),
                _ => None,
            })
            .collect()
    }

    fn streams(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Ev::Stream(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn hands(&self) -> Vec<(String, bool)> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Ev::Hand { peer, raised } => Some((peer, raised)),
                _ => None,
            })
            .collect()
    }
}

impl MeshEvents for Recorder {
    fn on_stream_available(
        &self,
        peer: &PeerId,
        _stream: &RemoteStream,
        _name: &str,
        _audio_enabled: bool,
        _video_enabled: bool,
    ) {
        self.events.lock().unwrap().push(Ev::Stream(peer.0.clone()));
    }

    fn on_peer_left(&self, peer: &PeerId) {
        self.events.lock().unwrap().push(Ev::Left(peer.0.clone()));
    }

    fn on_participant_count(&self, count: usize) {
        self.events.lock().unwrap().push(Ev::Count(count));
    }

    fn on_media_state(&self, peer: &PeerId, audio: bool, video: bool, screen: bool) {
        self.events.lock().unwrap().push(Ev::Media {
            peer: peer.0.clone(),
            audio,
            video,
            screen,
        });
    }

    fn on_hand_raised(&self, peer: &PeerId, _name: &str, raised: bool) {
        self.events.lock().unwrap().push(Ev::Hand {
            peer: peer.0.clone(),
            raised,
        });
    }
}

// ---------- scripted devices ----------

struct FakeDevices {
    failures_left: AtomicU32,
    screen_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl FakeDevices {
    fn new() -> Self {
        Self {
            failures_left: AtomicU32::new(0),
            screen_stop: Mutex::new(None),
        }
    }

    /// Simulates the user hitting the native stop-sharing control.
    fn end_screen(&self) {
        if let Some(stop) = self.screen_stop.lock().unwrap().take() {
            let _ = stop.send(());
        }
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open_input(
        &self,
        _profile: MediaProfile,
        video: bool,
        audio: bool,
    ) -> Result<LocalStream, MediaError> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(MediaError::PermissionDenied);
        }
        let mut tracks = Vec::new();
        if audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, TrackSource::Microphone));
        }
        if video {
            tracks.push(LocalTrack::new(TrackKind::Video, TrackSource::Camera));
        }
        Ok(LocalStream { tracks })
    }

    async fn open_screen(&self) -> Result<ScreenCapture, MediaError> {
        let (stop_tx, ended) = oneshot::channel();
        *self.screen_stop.lock().unwrap() = Some(stop_tx);
        Ok(ScreenCapture {
            stream: LocalStream {
                tracks: vec![LocalTrack::new(TrackKind::Video, TrackSource::Screen)],
            },
            ended,
        })
    }

    fn stop(&self, _track: &LocalTrack) {}
}

// ---------- scripted transports ----------

struct FakeTransport {
    peer: PeerId,
    owner: String,
    events: TransportEventSender,
    calls: Mutex<Vec<String>>,
    offer_delay: Duration,
}

impl FakeTransport {
    fn emit(&self, ev: TransportEvent) {
        let _ = self.events.send((self.peer.clone(), ev));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn sample_stream(&self) -> RemoteStream {
        RemoteStream {
            id: format!("stream-{}", self.owner),
            tracks: vec![
                RemoteTrack {
                    id: "a0".into(),
                    kind: TrackKind::Audio,
                },
                RemoteTrack {
                    id: "v0".into(),
                    kind: TrackKind::Video,
                },
            ],
        }
    }

    fn sample_candidate(&self) -> CandidateInit {
        CandidateInit {
            candidate: format!("candidate:1 1 udp 1 10.0.0.1 5000 typ host ({})", self.owner),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        self.push(if ice_restart {
            "create_offer_restart"
        } else {
            "create_offer"
        });
        sleep(self.offer_delay).await;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("offer-from-{}", self.owner),
        })
    }

    async fn accept_offer(
        &self,
        _offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.push("accept_offer");
        // Track first, connectivity later: the engine must surface the
        // stream regardless of connection state ordering.
        self.emit(TransportEvent::RemoteTrack(self.sample_stream()));
        self.emit(TransportEvent::LocalCandidate(self.sample_candidate()));
        self.emit(TransportEvent::StateChanged(TransportState::Connecting));
        self.emit(TransportEvent::StateChanged(TransportState::Connected));
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("answer-from-{}", self.owner),
        })
    }

    async fn apply_answer(&self, _answer: SessionDescription) -> Result<(), TransportError> {
        self.push("apply_answer");
        // Opposite ordering: connectivity first, then the track.
        self.emit(TransportEvent::StateChanged(TransportState::Connecting));
        self.emit(TransportEvent::StateChanged(TransportState::Connected));
        self.emit(TransportEvent::RemoteTrack(self.sample_stream()));
        self.emit(TransportEvent::LocalCandidate(self.sample_candidate()));
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: CandidateInit) -> Result<(), TransportError> {
        self.push("add_candidate");
        Ok(())
    }

    async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<(), TransportError> {
        self.push(format!("attach_tracks:{}", tracks.len()));
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.push(format!("replace_video:{}", track.id));
        Ok(())
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        self.push(format!("set_enabled:{kind:?}:{enabled}"));
    }

    async fn close(&self) {
        self.push("close");
    }
}

struct FakeFactory {
    owner: String,
    offer_delay: Mutex<Duration>,
    created: Mutex<HashMap<PeerId, Vec<Arc<FakeTransport>>>>,
}

impl FakeFactory {
    fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_owned(),
            offer_delay: Mutex::new(Duration::ZERO),
            created: Mutex::new(HashMap::new()),
        }
    }

    fn set_offer_delay(&self, delay: Duration) {
        *self.offer_delay.lock().unwrap() = delay;
    }

    /// Latest transport created toward `peer`.
    fn transport(&self, peer: &PeerId) -> Arc<FakeTransport> {
        self.created
            .lock()
            .unwrap()
            .get(peer)
            .and_then(|v| v.last().cloned())
            .unwrap_or_else(|| panic!("no transport created toward {peer}"))
    }

    fn created_count(&self, peer: &PeerId) -> usize {
        self.created
            .lock()
            .unwrap()
            .get(peer)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        peer: &PeerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(FakeTransport {
            peer: peer.clone(),
            owner: self.owner.clone(),
            events,
            calls: Mutex::new(Vec::new()),
            offer_delay: *self.offer_delay.lock().unwrap(),
        });
        self.created
            .lock()
            .unwrap()
            .entry(peer.clone())
            .or_default()
            .push(transport.clone());
        Ok(transport)
    }
}

// ---------- harness ----------

struct TestPeer {
    session: MeshSession,
    recorder: Arc<Recorder>,
    factory: Arc<FakeFactory>,
    devices: Arc<FakeDevices>,
    channel: meshcall::LocalChannel,
}

fn spawn_peer(hub: &meshcall::LocalHub, meeting: &str, id: &str, name: &str) -> TestPeer {
    spawn_peer_with(hub, meeting, id, name, Arc::new(OpenAdmission))
}

fn spawn_peer_with(
    hub: &meshcall::LocalHub,
    meeting: &str,
    id: &str,
    name: &str,
    admission: Arc<dyn AdmissionGate>,
) -> TestPeer {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut cfg = MeshConfig::new(meeting, name);
    cfg.identity = Identity {
        id: PeerId::from(id),
        name: name.to_owned(),
    };
    cfg.grace_period = Duration::from_millis(200);
    let channel = hub.channel(meeting);
    let recorder = Arc::new(Recorder::default());
    let factory = Arc::new(FakeFactory::new(id));
    let devices = Arc::new(FakeDevices::new());
    let session = MeshSession::spawn(
        cfg,
        Arc::new(channel.clone()),
        devices.clone(),
        factory.clone(),
        recorder.clone(),
        admission,
    );
    TestPeer {
        session,
        recorder,
        factory,
        devices,
        channel,
    }
}

/// Record every message crossing the hub for later inspection.
fn record_wire(channel: &meshcall::LocalChannel) -> Arc<Mutex<Vec<SignalMessage>>> {
    let mut rx = channel.subscribe();
    let store: Arc<Mutex<Vec<SignalMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = store.clone();
    tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            if let Ok(msg) = decode_signal(raw) {
                sink.lock().unwrap().push(msg);
            }
        }
    });
    store
}

fn count_negotiation(wire: &Mutex<Vec<SignalMessage>>) -> usize {
    wire.lock()
        .unwrap()
        .iter()
        .filter(|m| matches!(m.body, SignalBody::Offer { .. } | SignalBody::Answer { .. }))
        .count()
}

async fn inject(channel: &meshcall::LocalChannel, sender: &str, body: SignalBody) {
    channel
        .publish(&SignalMessage::new(PeerId::from(sender), None, body))
        .await
        .unwrap();
}

fn announce(name: &str) -> SignalBody {
    SignalBody::PresenceAnnounce {
        name: name.to_owned(),
        audio_enabled: true,
        video_enabled: true,
        screen_sharing: false,
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn phase_of(peer: &TestPeer, remote: &str) -> Option<PeerPhase> {
    peer.session
        .participants()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.peer.0 == remote)
        .map(|p| p.phase)
}

/// Two joined sessions, fully connected, with A carrying local media.
async fn connected_pair(hub: &meshcall::LocalHub) -> (TestPeer, TestPeer) {
    let b = spawn_peer(hub, "m1", "bbb", "bob");
    b.session.join_meeting().await.unwrap();
    let a = spawn_peer(hub, "m1", "aaa", "alice");
    a.session.initialize_media(true, true).await.unwrap();
    a.session.join_meeting().await.unwrap();

    wait_for(
        || pair_ready(&a, "bbb") && pair_ready(&b, "aaa"),
        "both sides connected",
    )
    .await;
    (a, b)
}

/// Recorder-based readiness check, usable from a sync `wait_for` closure.
fn pair_ready(peer: &TestPeer, remote: &str) -> bool {
    let transports = peer.factory.created.lock().unwrap();
    let Some(list) = transports.get(&PeerId::from(remote)) else {
        return false;
    };
    let Some(t) = list.last() else { return false };
    let calls = t.calls();
    calls.iter().any(|c| c == "apply_answer" || c == "accept_offer")
        && peer.recorder.streams().iter().any(|s| s == remote)
}

// ---------- scenarios ----------

#[tokio::test]
async fn newcomer_announce_makes_existing_member_offer() {
    let hub = meshcall::LocalHub::new();
    let b = spawn_peer(&hub, "m1", "bbb", "bob");
    let wire = record_wire(&b.channel);
    b.session.join_meeting().await.unwrap();
    assert_eq!(b.session.participant_count().await.unwrap(), 1);

    inject(&b.channel, "aaa", announce("alice")).await;

    wait_for(
        || {
            wire.lock().unwrap().iter().any(|m| {
                matches!(m.body, SignalBody::Offer { .. }) && m.sender.0 == "bbb"
            })
        },
        "offer from the existing member",
    )
    .await;

    assert_eq!(b.session.participant_count().await.unwrap(), 2);
    assert_eq!(phase_of(&b, "aaa").await, Some(PeerPhase::Offering));
    // Count went 1 -> 2 on the announce.
    assert!(b.recorder.counts().windows(2).any(|w| w == [1, 2]));
    let offer = wire
        .lock()
        .unwrap()
        .iter()
        .find(|m| matches!(m.body, SignalBody::Offer { .. }))
        .cloned()
        .unwrap();
    assert_eq!(offer.target, Some(PeerId::from("aaa")));
}

#[tokio::test]
async fn duplicate_announce_is_idempotent() {
    let hub = meshcall::LocalHub::new();
    let b = spawn_peer(&hub, "m1", "bbb", "bob");
    let wire = record_wire(&b.channel);
    b.session.join_meeting().await.unwrap();

    inject(&b.channel, "aaa", announce("alice")).await;
    inject(&b.channel, "aaa", announce("alice")).await;
    inject(&b.channel, "aaa", announce("alice")).await;
    sleep(Duration::from_millis(150)).await;

    assert_eq!(b.session.participant_count().await.unwrap(), 2);
    assert_eq!(b.factory.created_count(&PeerId::from("aaa")), 1);
    let offers = wire
        .lock()
        .unwrap()
        .iter()
        .filter(|m| matches!(m.body, SignalBody::Offer { .. }))
        .count();
    assert_eq!(offers, 1, "duplicate announce must not re-offer");
}

#[tokio::test]
async fn duplicate_leave_fires_exactly_one_notification() {
    let hub = meshcall::LocalHub::new();
    let b = spawn_peer(&hub, "m1", "bbb", "bob");
    b.session.join_meeting().await.unwrap();

    inject(&b.channel, "aaa", announce("alice")).await;
    wait_for(|| b.recorder.counts().contains(&2), "peer recorded").await;

    inject(&b.channel, "aaa", SignalBody::PresenceLeave).await;
    inject(&b.channel, "aaa", SignalBody::PresenceLeave).await;
    sleep(Duration::from_millis(150)).await;

    assert_eq!(b.recorder.lefts(), vec!["aaa".to_owned()]);
    assert_eq!(b.session.participant_count().await.unwrap(), 1);
    // The departed peer's transport was closed.
    assert!(b
        .factory
        .transport(&PeerId::from("aaa"))
        .calls()
        .contains(&"close".to_owned()));
}

#[tokio::test]
async fn two_sessions_converge_to_connected() {
    let hub = meshcall::LocalHub::new();
    let (a, b) = connected_pair(&hub).await;

    assert_eq!(phase_of(&a, "bbb").await, Some(PeerPhase::Connected));
    assert_eq!(phase_of(&b, "aaa").await, Some(PeerPhase::Connected));
    assert_eq!(a.session.participant_count().await.unwrap(), 2);
    assert_eq!(b.session.participant_count().await.unwrap(), 2);

    // Streams surfaced on both sides, despite opposite track/connectivity
    // orderings in the two transport scripts.
    assert!(a.recorder.streams().contains(&"bbb".to_owned()));
    assert!(b.recorder.streams().contains(&"aaa".to_owned()));

    // B initiated (A's announce triggered peer creation on B's side); A
    // answered on its own transport.
    assert!(b
        .factory
        .transport(&PeerId::from("aaa"))
        .calls()
        .contains(&"apply_answer".to_owned()));
    assert!(a
        .factory
        .transport(&PeerId::from("bbb"))
        .calls()
        .contains(&"accept_offer".to_owned()));

    // Candidates crossed and were applied; at least one side had to queue
    // until its remote description landed.
    wait_for(
        || {
            a.factory
                .transport(&PeerId::from("bbb"))
                .calls()
                .contains(&"add_candidate".to_owned())
                && b.factory
                    .transport(&PeerId::from("aaa"))
                    .calls()
                    .contains(&"add_candidate".to_owned())
        },
        "ice candidates applied on both sides",
    )
    .await;
}

#[tokio::test]
async fn glare_resolves_by_identity_tie_break() {
    let hub = meshcall::LocalHub::new();
    let a = spawn_peer(&hub, "m1", "aaa", "alice");
    let b = spawn_peer(&hub, "m1", "bbb", "bob");
    // Slow offers so both sides are mid-offer when the other's arrives.
    a.factory.set_offer_delay(Duration::from_millis(100));
    b.factory.set_offer_delay(Duration::from_millis(100));

    a.session.join_meeting().await.unwrap();
    b.session.join_meeting().await.unwrap();
    // B reacted to A's... nothing: A announced before B joined. Replay A's
    // announce so both sides now initiate toward each other concurrently.
    inject(&b.channel, "aaa", announce("alice")).await;

    wait_for(
        || pair_ready(&a, "bbb") && pair_ready(&b, "aaa"),
        "glare converged",
    )
    .await;

    assert_eq!(phase_of(&a, "bbb").await, Some(PeerPhase::Connected));
    assert_eq!(phase_of(&b, "aaa").await, Some(PeerPhase::Connected));

    // The greater identity (bbb) kept its offer; the smaller (aaa) yielded,
    // recreated its transport and answered.
    assert_eq!(a.factory.created_count(&PeerId::from("bbb")), 2);
    assert_eq!(b.factory.created_count(&PeerId::from("aaa")), 1);
    assert!(a
        .factory
        .transport(&PeerId::from("bbb"))
        .calls()
        .contains(&"accept_offer".to_owned()));
    let b_calls = b.factory.transport(&PeerId::from("aaa")).calls();
    assert!(b_calls.contains(&"apply_answer".to_owned()));
    assert!(!b_calls.contains(&"accept_offer".to_owned()));
}

#[tokio::test]
async fn mute_unmute_never_renegotiates() {
    let hub = meshcall::LocalHub::new();
    let (a, b) = connected_pair(&hub).await;
    let wire = record_wire(&a.channel);
    let baseline = count_negotiation(&wire);

    a.session.toggle_audio(false);
    a.session.toggle_audio(true);

    wait_for(
        || {
            let states = b.recorder.media_states();
            states.contains(&("aaa".into(), false, true, false))
                && states.contains(&("aaa".into(), true, true, false))
        },
        "both media-state broadcasts observed",
    )
    .await;

    assert_eq!(
        count_negotiation(&wire),
        baseline,
        "mute/unmute must produce zero offer/answer exchanges"
    );
    let calls = a.factory.transport(&PeerId::from("bbb")).calls();
    assert!(calls.contains(&"set_enabled:Audio:false".to_owned()));
    assert!(calls.contains(&"set_enabled:Audio:true".to_owned()));
    assert_eq!(
        calls.iter().filter(|c| *c == "create_offer").count(),
        0,
        "the offerer here was B; A must not have offered at all"
    );
}

#[tokio::test]
async fn screen_share_end_restores_camera_without_teardown() {
    let hub = meshcall::LocalHub::new();
    let (a, b) = connected_pair(&hub).await;
    let wire = record_wire(&a.channel);
    let baseline = count_negotiation(&wire);

    a.session.start_screen_share().await.unwrap();
    wait_for(
        || {
            b.recorder
                .media_states()
                .contains(&("aaa".into(), true, true, true))
        },
        "screen-share broadcast",
    )
    .await;
    let calls = a.factory.transport(&PeerId::from("bbb")).calls();
    assert!(
        calls.iter().any(|c| c.starts_with("replace_video:screen-")),
        "screen track swapped in place: {calls:?}"
    );

    // The user hits the browser's native stop-sharing control.
    a.devices.end_screen();
    wait_for(
        || {
            b.recorder
                .media_states()
                .contains(&("aaa".into(), true, true, false))
        },
        "share-ended broadcast",
    )
    .await;

    let calls = a.factory.transport(&PeerId::from("bbb")).calls();
    assert!(
        calls.iter().any(|c| c.starts_with("replace_video:cam-")),
        "camera track restored: {calls:?}"
    );
    assert!(!calls.contains(&"close".to_owned()), "no transport teardown");
    assert_eq!(count_negotiation(&wire), baseline, "no renegotiation");
}

#[tokio::test]
async fn short_flicker_survives_grace_long_outage_does_not() {
    let hub = meshcall::LocalHub::new();
    let (a, _b) = connected_pair(&hub).await;
    let transport = a.factory.transport(&PeerId::from("bbb"));

    // Flicker well inside the 200 ms grace window.
    transport.emit(TransportEvent::StateChanged(TransportState::Disconnected));
    sleep(Duration::from_millis(50)).await;
    transport.emit(TransportEvent::StateChanged(TransportState::Connected));
    sleep(Duration::from_millis(400)).await;

    assert!(a.recorder.lefts().is_empty(), "flicker must not drop the peer");
    assert_eq!(phase_of(&a, "bbb").await, Some(PeerPhase::Connected));
    assert_eq!(a.session.participant_count().await.unwrap(), 2);

    // Now stay down past the grace window.
    transport.emit(TransportEvent::StateChanged(TransportState::Disconnected));
    wait_for(|| !a.recorder.lefts().is_empty(), "grace expiry").await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(a.recorder.lefts(), vec!["bbb".to_owned()]);
    assert_eq!(a.session.participant_count().await.unwrap(), 1);
}

#[tokio::test]
async fn transport_failure_triggers_in_place_restart() {
    let hub = meshcall::LocalHub::new();
    let (a, b) = connected_pair(&hub).await;
    // B was the offerer toward A.
    let transport = b.factory.transport(&PeerId::from("aaa"));

    transport.emit(TransportEvent::StateChanged(TransportState::Failed));
    wait_for(
        || {
            transport
                .calls()
                .contains(&"create_offer_restart".to_owned())
        },
        "ice-restart offer",
    )
    .await;

    // The restart offer travels like any other and is answered in place.
    wait_for(
        || {
            let calls = a.factory.transport(&PeerId::from("bbb")).calls();
            calls.iter().filter(|c| *c == "accept_offer").count() >= 2
        },
        "restart offer answered on the existing transport",
    )
    .await;
    // Still one record, still connected, no extra transport on either side.
    assert_eq!(b.factory.created_count(&PeerId::from("aaa")), 1);
    assert_eq!(phase_of(&b, "aaa").await, Some(PeerPhase::Connected));
}

#[tokio::test]
async fn hand_raise_accepted_from_unconnected_peer_media_state_is_not() {
    let hub = meshcall::LocalHub::new();
    let b = spawn_peer(&hub, "m1", "bbb", "bob");
    b.session.join_meeting().await.unwrap();

    inject(
        &b.channel,
        "zzz",
        SignalBody::HandRaise {
            name: "zoe".into(),
            raised: true,
        },
    )
    .await;
    inject(
        &b.channel,
        "zzz",
        SignalBody::MediaState {
            audio_enabled: false,
            video_enabled: false,
            screen_sharing: false,
        },
    )
    .await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(b.recorder.hands(), vec![("zzz".to_owned(), true)]);
    assert!(
        b.recorder.media_states().is_empty(),
        "media-state from an unknown sender is ignored"
    );
}

#[tokio::test]
async fn pending_negotiation_after_peer_left_is_a_no_op() {
    let hub = meshcall::LocalHub::new();
    let b = spawn_peer(&hub, "m1", "bbb", "bob");
    b.factory.set_offer_delay(Duration::from_millis(150));
    let wire = record_wire(&b.channel);
    b.session.join_meeting().await.unwrap();

    inject(&b.channel, "aaa", announce("alice")).await;
    wait_for(|| b.recorder.counts().contains(&2), "peer recorded").await;
    // The offer task is still sleeping; the peer leaves underneath it.
    inject(&b.channel, "aaa", SignalBody::PresenceLeave).await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(b.recorder.lefts(), vec!["aaa".to_owned()]);
    let offers = wire
        .lock()
        .unwrap()
        .iter()
        .filter(|m| matches!(m.body, SignalBody::Offer { .. }))
        .count();
    assert_eq!(offers, 0, "stale offer completion must not be published");
}

#[tokio::test]
async fn leave_announces_and_tears_down_everything() {
    let hub = meshcall::LocalHub::new();
    let (a, b) = connected_pair(&hub).await;
    let wire = record_wire(&b.channel);

    a.session.leave_meeting().await;

    wait_for(|| b.recorder.lefts() == vec!["aaa".to_owned()], "b saw the leave").await;
    assert_eq!(b.session.participant_count().await.unwrap(), 1);
    assert!(wire
        .lock()
        .unwrap()
        .iter()
        .any(|m| matches!(m.body, SignalBody::PresenceLeave) && m.sender.0 == "aaa"));

    // The handle is dead afterwards.
    assert!(a.session.participant_count().await.is_err());
    assert!(a
        .factory
        .transport(&PeerId::from("bbb"))
        .calls()
        .contains(&"close".to_owned()));
}

#[tokio::test]
async fn rejected_admission_blocks_the_join_announcement() {
    struct ClosedDoor;
    #[async_trait]
    impl AdmissionGate for ClosedDoor {
        async fn admitted(&self, _participant: &PeerId) -> bool {
            false
        }
    }

    let hub = meshcall::LocalHub::new();
    let a = spawn_peer_with(&hub, "m1", "aaa", "alice", Arc::new(ClosedDoor));
    let wire = record_wire(&a.channel);

    let err = a.session.join_meeting().await;
    assert!(matches!(err, Err(meshcall::MeshError::NotAdmitted)));
    sleep(Duration::from_millis(100)).await;
    assert!(
        wire.lock().unwrap().is_empty(),
        "no announce may go out before admission"
    );
}

#[tokio::test]
async fn media_failure_after_fallback_aborts_the_flow() {
    let hub = meshcall::LocalHub::new();
    let a = spawn_peer(&hub, "m1", "aaa", "alice");
    a.devices.failures_left.store(2, Ordering::SeqCst);

    let err = a.session.initialize_media(true, true).await;
    assert!(matches!(err, Err(meshcall::MeshError::Media(_))));

    // One fallback retry only: both attempts consumed, no third.
    assert_eq!(a.devices.failures_left.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn raise_hand_reaches_every_member() {
    let hub = meshcall::LocalHub::new();
    let (a, b) = connected_pair(&hub).await;

    a.session.raise_hand(true);
    wait_for(|| b.recorder.hands() == vec![("aaa".to_owned(), true)], "hand up").await;

    a.session.raise_hand(false);
    wait_for(
        || b.recorder.hands() == vec![("aaa".to_owned(), true), ("aaa".to_owned(), false)],
        "hand down",
    )
    .await;
    // Self-originated broadcasts are never folded back locally.
    assert!(a.recorder.hands().is_empty());
}
