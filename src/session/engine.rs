use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{RemotePeer, SessionCommand, SessionDeps, SessionSnapshot, SessionState};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{Capability, Notice, Observers};
use crate::media::{self, MediaConstraints, MediaStream, MediaTrack, TrackKind, TrackSource};
use crate::peer::registry::{PeerFailure, PeerRegistry};
use crate::peer::{PeerEvent, PeerLink, PeerRole, PeerState, RemoteStream};
use crate::signaling::{InboundFrame, OutboundFrame, UserId};
use crate::transport::{TransportEvent, TransportLink};

/// Owns every piece of mutable session state. Commands, transport frames,
/// peer events and local track endings are handled one at a time.
pub(crate) struct SessionEngine {
    config: SessionConfig,
    deps: SessionDeps,
    observers: Observers,
    state_tx: watch::Sender<SessionSnapshot>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    registry: PeerRegistry,
    link: Option<TransportLink>,

    state: SessionState,
    session_id: Option<String>,
    user_id: Option<UserId>,
    camera_stream: Option<MediaStream>,
    screen_stream: Option<MediaStream>,
    audio_enabled: bool,
    video_enabled: bool,
    screen_sharing: bool,
}

impl SessionEngine {
    pub(crate) fn new(
        config: SessionConfig,
        deps: SessionDeps,
        observers: Observers,
        state_tx: watch::Sender<SessionSnapshot>,
        cmd_rx: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let registry = PeerRegistry::new(deps.peers.clone(), peer_tx.clone());
        Self {
            config,
            deps,
            observers,
            state_tx,
            cmd_rx,
            peer_tx,
            peer_rx,
            registry,
            link: None,
            state: SessionState::Uninitialized,
            session_id: None,
            user_id: None,
            camera_stream: None,
            screen_stream: None,
            audio_enabled: false,
            video_enabled: false,
            screen_sharing: false,
        }
    }

    /// Run until cleanup, transport close, or the coordinator handle is dropped.
    pub(crate) async fn run(mut self) {
        debug!("Session engine started");
        loop {
            let watched = self.watched_tracks();
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        self.cleanup("session dropped").await;
                        break;
                    };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                event = next_transport_event(&mut self.link) => {
                    match event {
                        TransportEvent::Frame(frame) => self.handle_frame(frame).await,
                        TransportEvent::Closed { reason } => {
                            warn!("Signaling transport closed: {}", reason);
                            self.cleanup(&reason).await;
                            break;
                        }
                    }
                }
                Some(event) = self.peer_rx.recv() => {
                    self.handle_peer_event(event).await;
                }
                track = next_ended(watched) => {
                    self.handle_track_ended(track).await;
                }
            }
        }
        debug!("Session engine stopped");
    }

    /// Returns false once the engine should stop.
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Initialize {
                session_id,
                user_id,
                token,
                reply,
            } => {
                let result = self.initialize(session_id, user_id, &token).await;
                let fatal = matches!(&result, Err(e) if e.is_fatal());
                if let (true, Err(e)) = (fatal, &result) {
                    error!("Session initialize failed: {}", e);
                    self.cleanup(&e.to_string()).await;
                }
                let _ = reply.send(result);
                !fatal
            }
            SessionCommand::ToggleAudio { enable, reply } => {
                let _ = reply.send(self.toggle(TrackKind::Audio, enable).await);
                true
            }
            SessionCommand::ToggleVideo { enable, reply } => {
                let _ = reply.send(self.toggle(TrackKind::Video, enable).await);
                true
            }
            SessionCommand::StartScreenShare { reply } => {
                let _ = reply.send(self.start_screen_share().await);
                true
            }
            SessionCommand::StopScreenShare { reply } => {
                let result = match self.ensure_ready() {
                    Ok(()) => {
                        self.revert_screen_share().await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
                true
            }
            SessionCommand::SendChat { message, reply } => {
                let result = self
                    .ensure_ready()
                    .and_then(|_| self.send_frame(OutboundFrame::ChatMessage { message }));
                let _ = reply.send(result);
                true
            }
            SessionCommand::SendHandRaise { raised, reply } => {
                let result = self.ensure_ready().and_then(|_| {
                    self.send_frame(OutboundFrame::HandRaise {
                        hand_raised: raised,
                    })
                });
                let _ = reply.send(result);
                true
            }
            SessionCommand::LocalStream { reply } => {
                let _ = reply.send(self.camera_stream.clone());
                true
            }
            SessionCommand::Cleanup { reply } => {
                self.cleanup("session closed").await;
                let _ = reply.send(());
                false
            }
        }
    }

    async fn initialize(&mut self, session_id: String, user_id: UserId, token: &str) -> Result<()> {
        match self.state {
            SessionState::Uninitialized => {}
            SessionState::Closed => return Err(Error::Closed),
            _ => return Err(Error::InvalidState("session already initialized")),
        }

        info!("Initializing session {} as user {}", session_id, user_id);
        self.state = SessionState::Connecting;
        self.session_id = Some(session_id.clone());
        self.user_id = Some(user_id);
        self.publish();

        self.deps.peers.prepare().await.map_err(|e| match e {
            Error::LibraryLoad(_) => e,
            other => Error::LibraryLoad(other.to_string()),
        })?;

        let link = self
            .deps
            .connector
            .connect(&session_id, token)
            .await
            .map_err(|e| match e {
                Error::TransportConnect(_) => e,
                other => Error::TransportConnect(other.to_string()),
            })?;
        self.link = Some(link);

        let constraints = MediaConstraints::new(true, true, &self.config.media);
        match media::acquire(self.deps.media.as_ref(), constraints).await {
            Ok(stream) => {
                for track in stream.tracks() {
                    let failures = self.registry.attach_local_track(track).await;
                    self.report_failures(failures);
                }
                self.audio_enabled = stream.live_track(TrackKind::Audio).is_some();
                self.video_enabled = stream.live_track(TrackKind::Video).is_some();
                self.camera_stream = Some(stream);
            }
            Err(error) => {
                warn!("Joining session without local media: {}", error);
                self.notice(Notice::Media {
                    capability: Capability::CameraAndMicrophone,
                    error,
                });
            }
        }

        self.state = SessionState::Ready;
        self.publish();
        self.broadcast_participant_state();
        info!(
            "Session {} ready (audio={}, video={})",
            session_id, self.audio_enabled, self.video_enabled
        );
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(Error::Closed),
            _ => Err(Error::InvalidState("session not ready")),
        }
    }

    async fn toggle(&mut self, kind: TrackKind, enable: bool) -> Result<bool> {
        self.ensure_ready()?;

        let existing = self
            .camera_stream
            .as_ref()
            .and_then(|s| s.live_track(kind))
            .cloned();

        // Outgoing video belongs to the screen while sharing.
        let outgoing = kind == TrackKind::Audio || !self.screen_sharing;
        match existing {
            Some(track) => {
                track.set_enabled(enable);
                // A held track may have been dropped from the peers by a screen share revert.
                if enable && outgoing && self.registry.local_track(kind) != Some(&track) {
                    let failures = self.registry.attach_local_track(&track).await;
                    self.report_failures(failures);
                }
            }
            None if enable => {
                let track = self.acquire_track(kind).await?;
                if outgoing {
                    let failures = self.registry.attach_local_track(&track).await;
                    self.report_failures(failures);
                }
            }
            None => {}
        }

        match kind {
            TrackKind::Audio => self.audio_enabled = enable,
            TrackKind::Video => self.video_enabled = enable,
        }
        info!("Local {} {}", kind, if enable { "enabled" } else { "disabled" });
        self.publish();
        self.broadcast_participant_state();
        Ok(enable)
    }

    /// Acquire a fresh camera or microphone track and add it to the local stream.
    async fn acquire_track(&mut self, kind: TrackKind) -> Result<MediaTrack> {
        let (constraints, capability) = match kind {
            TrackKind::Audio => (
                MediaConstraints::audio_only(&self.config.media),
                Capability::Microphone,
            ),
            TrackKind::Video => (
                MediaConstraints::video_only(&self.config.media),
                Capability::Camera,
            ),
        };

        let acquired = match media::acquire(self.deps.media.as_ref(), constraints).await {
            Ok(stream) => stream,
            Err(error) => {
                self.notice(Notice::Media {
                    capability,
                    error: error.clone(),
                });
                return Err(Error::Media(error));
            }
        };

        let Some(track) = acquired.live_track(kind).cloned() else {
            acquired.stop();
            let error = media::MediaError::Unknown(format!("no {} track in acquired stream", kind));
            self.notice(Notice::Media {
                capability,
                error: error.clone(),
            });
            return Err(Error::Media(error));
        };
        // Stop anything else the device handed back.
        for extra in acquired.tracks().iter().filter(|t| **t != track) {
            extra.stop();
        }

        let stream = self
            .camera_stream
            .get_or_insert_with(|| MediaStream::new(Vec::new()));
        let stale: Vec<String> = stream
            .tracks()
            .iter()
            .filter(|t| t.kind() == kind && !t.is_live())
            .map(|t| t.id().to_string())
            .collect();
        for id in stale {
            stream.remove_track(&id);
        }
        stream.add_track(track.clone());
        Ok(track)
    }

    async fn start_screen_share(&mut self) -> Result<()> {
        self.ensure_ready()?;
        if self.screen_sharing {
            return Ok(());
        }

        let stream = match media::acquire_display(self.deps.media.as_ref()).await {
            Ok(stream) => stream,
            Err(error) => {
                self.notice(Notice::Media {
                    capability: Capability::ScreenShare,
                    error: error.clone(),
                });
                return Err(Error::Media(error));
            }
        };
        let Some(screen) = stream.live_track(TrackKind::Video).cloned() else {
            stream.stop();
            let error = media::MediaError::Unknown("display capture has no video".into());
            self.notice(Notice::Media {
                capability: Capability::ScreenShare,
                error: error.clone(),
            });
            return Err(Error::Media(error));
        };

        let failures = self.registry.replace_video_track(Some(&screen)).await;
        self.report_failures(failures);
        self.screen_stream = Some(stream);
        self.screen_sharing = true;
        info!("Screen sharing started ({})", screen.label());
        self.publish();
        self.send_frame_logged(OutboundFrame::ScreenShare {
            screen_sharing: true,
        });
        Ok(())
    }

    /// Put the camera back (if video is on) and release the display capture.
    async fn revert_screen_share(&mut self) {
        if !self.screen_sharing {
            return;
        }

        let camera = if self.video_enabled {
            self.camera_stream
                .as_ref()
                .and_then(|s| s.live_track(TrackKind::Video))
                .cloned()
        } else {
            None
        };
        let failures = self.registry.replace_video_track(camera.as_ref()).await;
        self.report_failures(failures);

        if let Some(stream) = self.screen_stream.take() {
            stream.stop();
        }
        self.screen_sharing = false;
        info!(
            "Screen sharing stopped, outgoing video is {}",
            if camera.is_some() { "camera" } else { "absent" }
        );
        self.publish();
        self.send_frame_logged(OutboundFrame::ScreenShare {
            screen_sharing: false,
        });
    }

    async fn handle_track_ended(&mut self, track: MediaTrack) {
        if track.source() == TrackSource::Screen {
            info!("Display capture ended by the system control");
            self.revert_screen_share().await;
            return;
        }

        let kind = track.kind();
        if let Some(stream) = self.camera_stream.as_mut() {
            stream.remove_track(track.id());
        }
        if self.registry.local_track(kind) == Some(&track) {
            let failures = self.registry.detach_local_track(kind).await;
            self.report_failures(failures);
        }

        let capability = match kind {
            TrackKind::Audio => {
                self.audio_enabled = false;
                Capability::Microphone
            }
            TrackKind::Video => {
                self.video_enabled = false;
                Capability::Camera
            }
        };
        warn!("Local {} track {} ended", kind, track.label());
        self.publish();
        self.broadcast_participant_state();
        self.notice(Notice::DeviceEnded { capability });
    }

    async fn handle_frame(&mut self, frame: InboundFrame) {
        if self.user_id.is_some() && frame.user_id() == self.user_id {
            debug!("Ignoring own {:?} frame", frame);
            return;
        }

        match frame {
            InboundFrame::UserJoined { user_id, user_name } => {
                info!("User {} ({}) joined", user_id, user_name);
                if self.ensure_peer(user_id, PeerRole::Initiator).await.is_some() {
                    if let Some(entry) = self.registry.get_mut(user_id) {
                        entry.user_name = Some(user_name.clone());
                        self.publish();
                    }
                }
                self.observers
                    .emit(|o| o.on_user_joined(user_id, &user_name));
            }
            InboundFrame::UserLeft { user_id } => {
                info!("User {} left", user_id);
                if self.registry.remove_peer(user_id).await.is_some() {
                    self.publish();
                }
                self.observers.emit(|o| o.on_user_left(user_id));
            }
            InboundFrame::WebrtcSignal {
                from_user_id,
                signal,
            } => {
                let Some(link) = self.ensure_peer(from_user_id, PeerRole::Responder).await else {
                    return;
                };
                if let Err(e) = link.signal(signal).await {
                    warn!("Failed to apply signal from user {}: {}", from_user_id, e);
                    self.notice(Notice::PeerError {
                        user_id: from_user_id,
                    });
                }
            }
            InboundFrame::ChatMessage {
                user_id,
                user_name,
                message,
            } => {
                self.observers
                    .emit(|o| o.on_chat_message(user_id, &user_name, &message));
            }
            InboundFrame::ParticipantStateUpdate {
                user_id,
                audio_enabled,
                video_enabled,
            } => {
                self.observers.emit(|o| {
                    o.on_participant_state_update(user_id, audio_enabled, video_enabled)
                });
            }
            InboundFrame::HandRaiseUpdate {
                user_id,
                hand_raised,
            } => {
                self.observers
                    .emit(|o| o.on_hand_raise_update(user_id, hand_raised));
            }
            InboundFrame::ScreenShareUpdate {
                user_id,
                screen_sharing,
            } => {
                if let Some(entry) = self.registry.get_mut(user_id) {
                    entry.screen_sharing = screen_sharing;
                    self.publish();
                }
                self.observers
                    .emit(|o| o.on_screen_share_received(user_id, screen_sharing));
            }
            InboundFrame::Unknown => {}
        }
    }

    /// Look up or create the peer for `user_id`. Creation failures are
    /// reported and leave the registry untouched.
    async fn ensure_peer(&mut self, user_id: UserId, role: PeerRole) -> Option<Arc<dyn PeerLink>> {
        match self.registry.ensure_peer(user_id, role).await {
            Ok(ensured) => {
                if ensured.created {
                    self.spawn_handshake_watchdog(user_id, ensured.generation);
                    self.publish();
                }
                Some(ensured.link)
            }
            Err(e) => {
                warn!("Failed to create peer connection for user {}: {}", user_id, e);
                self.notice(Notice::PeerError { user_id });
                None
            }
        }
    }

    fn spawn_handshake_watchdog(&self, user_id: UserId, generation: u64) {
        let Some(timeout) = self.config.handshake_timeout() else {
            return;
        };
        let tx = self.peer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(PeerEvent::HandshakeTimeout {
                user_id,
                generation,
            });
        });
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Signal { user_id, signal } => {
                if !self.registry.contains(user_id) {
                    debug!("Dropping signal for removed peer {}", user_id);
                    return;
                }
                self.send_frame_logged(OutboundFrame::WebrtcSignal {
                    target_user_id: user_id,
                    signal,
                });
            }
            PeerEvent::RemoteStream { user_id, stream } => {
                let Some(entry) = self.registry.get_mut(user_id) else {
                    return;
                };
                let merged = merge_remote_stream(&mut entry.streams, stream);
                debug!(
                    "Remote stream {} from user {} now has {} tracks",
                    merged.id,
                    user_id,
                    merged.tracks.len()
                );
                self.observers
                    .emit(|o| o.on_stream_received(user_id, &merged));
            }
            PeerEvent::StateChanged { user_id, state } => {
                let Some(entry) = self.registry.get_mut(user_id) else {
                    return;
                };
                entry.state = state;
                debug!("Peer {} is {}", user_id, state);
                if state == PeerState::Failed {
                    warn!("Peer connection to user {} failed", user_id);
                    self.registry.remove_peer(user_id).await;
                    self.publish();
                    self.notice(Notice::PeerError { user_id });
                }
            }
            PeerEvent::Error { user_id, reason } => {
                warn!("Peer {} error: {}", user_id, reason);
                self.notice(Notice::PeerError { user_id });
            }
            PeerEvent::HandshakeTimeout {
                user_id,
                generation,
            } => {
                let stuck = self
                    .registry
                    .get(user_id)
                    .map(|e| e.generation == generation && e.state != PeerState::Connected)
                    .unwrap_or(false);
                if stuck {
                    warn!("Peer {} did not connect in time, dropping it", user_id);
                    self.registry.remove_peer(user_id).await;
                    self.publish();
                    self.notice(Notice::PeerTimeout { user_id });
                }
            }
        }
    }

    /// Tear everything down. Safe to call in any state.
    async fn cleanup(&mut self, reason: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        info!("Cleaning up session: {}", reason);

        if let Some(stream) = self.screen_stream.take() {
            stream.stop();
        }
        if let Some(stream) = self.camera_stream.take() {
            stream.stop();
        }
        self.registry.close_all().await;
        self.registry.clear_local_tracks();
        if let Some(mut link) = self.link.take() {
            link.close();
        }

        self.session_id = None;
        self.user_id = None;
        self.audio_enabled = false;
        self.video_enabled = false;
        self.screen_sharing = false;
        self.state = SessionState::Closed;
        self.publish();
        self.observers.emit(|o| o.on_closed(reason));
    }

    fn broadcast_participant_state(&self) {
        self.send_frame_logged(OutboundFrame::ParticipantState {
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
        });
    }

    fn send_frame(&self, frame: OutboundFrame) -> Result<()> {
        self.link
            .as_ref()
            .ok_or(Error::TransportClosed)?
            .send(frame)
    }

    fn send_frame_logged(&self, frame: OutboundFrame) {
        if let Err(e) = self.send_frame(frame) {
            debug!("Signaling frame not sent: {}", e);
        }
    }

    fn report_failures(&self, failures: Vec<PeerFailure>) {
        for failure in failures {
            self.notice(Notice::PeerError {
                user_id: failure.user_id,
            });
        }
    }

    fn notice(&self, notice: Notice) {
        self.observers.emit(|o| o.on_notice(&notice));
    }

    fn watched_tracks(&self) -> Vec<MediaTrack> {
        self.camera_stream
            .iter()
            .chain(self.screen_stream.iter())
            .flat_map(|s| s.tracks().iter())
            .filter(|t| t.is_live())
            .cloned()
            .collect()
    }

    fn publish(&self) {
        let peers = self.registry.peer_ids();
        let remote_peers = peers
            .iter()
            .filter_map(|&user_id| {
                self.registry.get(user_id).map(|entry| RemotePeer {
                    user_id,
                    user_name: entry.user_name.clone(),
                    screen_sharing: entry.screen_sharing,
                })
            })
            .collect();
        self.state_tx.send_replace(SessionSnapshot {
            state: self.state,
            session_id: self.session_id.clone(),
            user_id: self.user_id,
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            screen_sharing: self.screen_sharing,
            peers,
            remote_peers,
        });
    }
}

async fn next_transport_event(link: &mut Option<TransportLink>) -> TransportEvent {
    match link {
        Some(link) => link.recv().await.unwrap_or(TransportEvent::Closed {
            reason: "transport ended".to_string(),
        }),
        None => std::future::pending().await,
    }
}

/// Resolves with the first of `tracks` to end. Never resolves for an empty list.
async fn next_ended(tracks: Vec<MediaTrack>) -> MediaTrack {
    if tracks.is_empty() {
        return std::future::pending().await;
    }
    let waits = tracks.into_iter().map(|track| {
        Box::pin(async move {
            track.ended().await;
            track
        })
    });
    let (track, _, _) = futures::future::select_all(waits).await;
    track
}

/// Fold `incoming` into the known streams of one peer, returning the merged stream.
fn merge_remote_stream(streams: &mut Vec<RemoteStream>, incoming: RemoteStream) -> RemoteStream {
    match streams.iter_mut().find(|s| s.id == incoming.id) {
        Some(existing) => {
            for track in incoming.tracks {
                if !existing.tracks.contains(&track) {
                    existing.tracks.push(track);
                }
            }
            existing.clone()
        }
        None => {
            streams.push(incoming.clone());
            incoming
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::RemoteTrack;

    fn track(id: &str, kind: TrackKind) -> RemoteTrack {
        RemoteTrack {
            id: id.to_string(),
            kind,
        }
    }

    #[test]
    fn remote_streams_merge_by_id() {
        let mut streams = Vec::new();
        let first = merge_remote_stream(
            &mut streams,
            RemoteStream {
                id: "cam".into(),
                tracks: vec![track("a", TrackKind::Audio)],
            },
        );
        assert_eq!(first.tracks.len(), 1);

        let merged = merge_remote_stream(
            &mut streams,
            RemoteStream {
                id: "cam".into(),
                tracks: vec![track("a", TrackKind::Audio), track("v", TrackKind::Video)],
            },
        );
        assert!(merged.has_kind(TrackKind::Video));
        assert_eq!(merged.tracks.len(), 2);
        assert_eq!(streams.len(), 1);

        merge_remote_stream(
            &mut streams,
            RemoteStream {
                id: "screen".into(),
                tracks: vec![track("s", TrackKind::Video)],
            },
        );
        assert_eq!(streams.len(), 2);
    }

    #[tokio::test]
    async fn next_ended_picks_the_ended_track() {
        let mic = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let cam = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        let waiter = tokio::spawn(next_ended(vec![mic.clone(), cam.clone()]));
        cam.end();
        assert_eq!(waiter.await.unwrap(), cam);
        assert!(mic.is_live());
    }

    #[tokio::test]
    async fn missing_link_never_yields_events() {
        let mut link = None;
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            next_transport_event(&mut link),
        )
        .await;
        assert!(pending.is_err());
    }
}
