#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tutorcall_lib::config::SessionConfig;
use tutorcall_lib::error::{Error, Result};
use tutorcall_lib::events::{ChannelObserver, SessionEvent};
use tutorcall_lib::media::synthetic::SyntheticDevices;
use tutorcall_lib::media::{MediaError, MediaTrack, TrackKind, TrackSource};
use tutorcall_lib::peer::{
    PeerEvent, PeerEventSender, PeerFactory, PeerLink, PeerRole, PeerState, RemoteStream, RemoteTrack,
};
use tutorcall_lib::session::{SessionCoordinator, SessionDeps};
use tutorcall_lib::signaling::{InboundFrame, OutboundFrame, PeerSignal, SdpKind, UserId};
use tutorcall_lib::transport::{SignalingConnector, TransportEvent, TransportLink};

pub const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Peer library stand-in
// ---------------------------------------------------------------------------

/// Describes outgoing tracks as `mock <stream>/<kind>/<id> ...`.
fn encode_sdp(tracks: &[MediaTrack]) -> String {
    let mut sdp = String::from("mock");
    for track in tracks {
        let stream = match track.source() {
            TrackSource::Screen => "screen",
            _ => "camera",
        };
        sdp.push_str(&format!(" {}/{}/{}", stream, track.kind(), track.id()));
    }
    sdp
}

fn decode_sdp(sdp: &str) -> Vec<RemoteStream> {
    let mut streams: Vec<RemoteStream> = Vec::new();
    for entry in sdp.split_whitespace().skip(1) {
        let mut parts = entry.splitn(3, '/');
        let (Some(stream), Some(kind), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let kind = if kind == "audio" { TrackKind::Audio } else { TrackKind::Video };
        let track = RemoteTrack {
            id: id.to_string(),
            kind,
        };
        match streams.iter_mut().find(|s| s.id == stream) {
            Some(existing) => existing.tracks.push(track),
            None => streams.push(RemoteStream {
                id: stream.to_string(),
                tracks: vec![track],
            }),
        }
    }
    streams
}

/// In-memory peer link that negotiates by exchanging its track list.
pub struct MockLink {
    pub user_id: UserId,
    pub role: PeerRole,
    events: PeerEventSender,
    tracks: Mutex<Vec<MediaTrack>>,
    received: Mutex<Vec<PeerSignal>>,
    closed: AtomicBool,
    broken: bool,
}

impl MockLink {
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn outgoing(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.tracks().into_iter().rev().find(|t| t.kind() == kind)
    }

    pub fn received(&self) -> Vec<PeerSignal> {
        self.received.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    async fn send_description(&self, kind: SdpKind) {
        let sdp = encode_sdp(&self.tracks());
        let signal = match kind {
            SdpKind::Offer => PeerSignal::offer(sdp),
            SdpKind::Answer => PeerSignal::answer(sdp),
        };
        self.emit(PeerEvent::Signal {
            user_id: self.user_id,
            signal,
        })
        .await;
    }

    async fn renegotiate(&self) {
        match self.role {
            PeerRole::Initiator => self.send_description(SdpKind::Offer).await,
            PeerRole::Responder => {
                self.emit(PeerEvent::Signal {
                    user_id: self.user_id,
                    signal: PeerSignal::renegotiate(),
                })
                .await
            }
        }
    }

    async fn report_remote(&self, sdp: &str) {
        for stream in decode_sdp(sdp) {
            self.emit(PeerEvent::RemoteStream {
                user_id: self.user_id,
                stream,
            })
            .await;
        }
    }

    fn check(&self) -> Result<()> {
        if self.broken {
            Err(Error::WebRtc(format!("link to {} is broken", self.user_id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn signal(&self, signal: PeerSignal) -> Result<()> {
        self.received.lock().unwrap().push(signal.clone());
        match signal {
            PeerSignal::Description {
                kind: SdpKind::Offer,
                sdp,
            } => {
                self.report_remote(&sdp).await;
                self.send_description(SdpKind::Answer).await;
                self.emit(PeerEvent::StateChanged {
                    user_id: self.user_id,
                    state: PeerState::Connected,
                })
                .await;
            }
            PeerSignal::Description {
                kind: SdpKind::Answer,
                sdp,
            } => {
                self.report_remote(&sdp).await;
                self.emit(PeerEvent::StateChanged {
                    user_id: self.user_id,
                    state: PeerState::Connected,
                })
                .await;
            }
            PeerSignal::Renegotiate { renegotiate: true } if self.role == PeerRole::Initiator => {
                self.send_description(SdpKind::Offer).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        self.check()?;
        self.tracks.lock().unwrap().push(track.clone());
        self.renegotiate().await;
        Ok(())
    }

    async fn remove_track(&self, track: &MediaTrack) -> Result<()> {
        self.check()?;
        self.tracks.lock().unwrap().retain(|t| t != track);
        self.renegotiate().await;
        Ok(())
    }

    async fn replace_track(&self, old: Option<&MediaTrack>, new: Option<&MediaTrack>) -> Result<()> {
        self.check()?;
        {
            let mut tracks = self.tracks.lock().unwrap();
            if let Some(old) = old {
                tracks.retain(|t| t != old);
            }
            if let Some(new) = new {
                tracks.push(new.clone());
            }
        }
        if old.is_none() || new.is_none() {
            self.renegotiate().await;
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockPeerFactory {
    broken_users: Mutex<HashSet<UserId>>,
    fail_prepare: AtomicBool,
    created: AtomicUsize,
    links: Mutex<HashMap<UserId, Arc<MockLink>>>,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_prepare() -> Arc<Self> {
        let factory = Self::default();
        factory.fail_prepare.store(true, Ordering::SeqCst);
        Arc::new(factory)
    }

    /// Track operations on links to `user` will fail.
    pub fn break_user(&self, user: UserId) {
        self.broken_users.lock().unwrap().insert(user);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// The most recent link created for `user`.
    pub fn link(&self, user: UserId) -> Arc<MockLink> {
        self.links.lock().unwrap()[&user].clone()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn prepare(&self) -> Result<()> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::LibraryLoad("mock library missing".into()));
        }
        Ok(())
    }

    async fn create(
        &self,
        remote: UserId,
        role: PeerRole,
        seed_tracks: &[MediaTrack],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerLink>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(MockLink {
            user_id: remote,
            role,
            events,
            tracks: Mutex::new(seed_tracks.to_vec()),
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            broken: self.broken_users.lock().unwrap().contains(&remote),
        });
        self.links.lock().unwrap().insert(remote, link.clone());
        if role == PeerRole::Initiator {
            link.send_description(SdpKind::Offer).await;
        }
        Ok(link)
    }
}

// ---------------------------------------------------------------------------
// Scripted signaling server
// ---------------------------------------------------------------------------

/// The server side of a scripted connection.
pub struct ScriptedRemote {
    pub token: String,
    inbound: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl ScriptedRemote {
    pub async fn push(&self, frame: InboundFrame) {
        self.inbound
            .send(TransportEvent::Frame(frame))
            .await
            .expect("session engine gone");
    }

    pub async fn close(&self, reason: &str) {
        let _ = self
            .inbound
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Next frame the client sent that satisfies `pred`; earlier frames are discarded.
    pub async fn next_matching(&mut self, pred: impl Fn(&OutboundFrame) -> bool) -> OutboundFrame {
        tokio::time::timeout(WAIT, async {
            loop {
                let frame = self.outbound.recv().await.expect("client transport closed");
                if pred(&frame) {
                    return frame;
                }
            }
        })
        .await
        .expect("timed out waiting for an outbound frame")
    }

    /// Everything the client has sent so far.
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

#[derive(Default)]
pub struct ScriptedConnector {
    refuse: AtomicBool,
    remote: Mutex<Option<ScriptedRemote>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing() -> Arc<Self> {
        let connector = Self::default();
        connector.refuse.store(true, Ordering::SeqCst);
        Arc::new(connector)
    }

    pub fn take_remote(&self) -> ScriptedRemote {
        self.remote
            .lock()
            .unwrap()
            .take()
            .expect("no connection was opened")
    }
}

#[async_trait]
impl SignalingConnector for ScriptedConnector {
    async fn connect(&self, _room_id: &str, token: &str) -> Result<TransportLink> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::TransportConnect("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(64);
        *self.remote.lock().unwrap() = Some(ScriptedRemote {
            token: token.to_string(),
            inbound: in_tx,
            outbound: out_rx,
        });
        Ok(TransportLink::new(out_tx, in_rx))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub coordinator: SessionCoordinator,
    pub factory: Arc<MockPeerFactory>,
    pub devices: SyntheticDevices,
    pub remote: ScriptedRemote,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub const SELF_ID: UserId = 1;

impl Harness {
    /// Initialized session with camera and microphone.
    pub async fn ready() -> Self {
        Self::build(SessionConfig::default(), SyntheticDevices::new(), None).await
    }

    /// Initialized session whose first acquisition failed, so it holds no media.
    pub async fn ready_without_media() -> Self {
        let devices = SyntheticDevices::new();
        devices.fail_next(MediaError::PermissionDenied);
        Self::build(SessionConfig::default(), devices, None).await
    }

    pub async fn with_factory(factory: Arc<MockPeerFactory>, devices: SyntheticDevices) -> Self {
        Self::build(SessionConfig::default(), devices, Some(factory)).await
    }

    pub async fn build(
        config: SessionConfig,
        devices: SyntheticDevices,
        factory: Option<Arc<MockPeerFactory>>,
    ) -> Self {
        let factory = factory.unwrap_or_else(MockPeerFactory::new);
        let connector = ScriptedConnector::new();
        let deps = SessionDeps {
            connector: connector.clone(),
            peers: factory.clone(),
            media: Arc::new(devices.clone()),
        };
        let coordinator = SessionCoordinator::new(config, deps);
        let (observer, events) = ChannelObserver::new();
        coordinator.set_callbacks(observer);
        coordinator
            .initialize("session-1", SELF_ID, "token-1")
            .await
            .expect("initialize");
        Self {
            coordinator,
            factory,
            devices,
            remote: connector.take_remote(),
            events,
        }
    }

    pub async fn join(&self, user_id: UserId) {
        self.remote
            .push(InboundFrame::UserJoined {
                user_id,
                user_name: format!("user{}", user_id),
            })
            .await;
    }

    /// Wait until the coordinator has registered exactly `ids`.
    pub async fn wait_for_peers(&self, ids: &[UserId]) {
        let mut rx = self.coordinator.subscribe_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| s.peers == ids))
            .await
            .expect("timed out waiting for peers")
            .expect("engine gone");
    }

    pub async fn next_event(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        next_event(&mut self.events, pred).await
    }
}

pub async fn next_event(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("observer channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for a session event")
}

/// Poll `cond` until it holds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
