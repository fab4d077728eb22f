//! Peer links backed by the `webrtc` crate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as WrtcMediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{PeerEvent, PeerEventSender, PeerFactory, PeerLink, PeerRole, PeerState, RemoteStream, RemoteTrack};
use crate::config::IceServerConfig;
use crate::error::{Error, Result};
use crate::media::{MediaTrack, TrackKind, TrackSource};
use crate::signaling::{IceCandidate, PeerSignal, SdpKind, UserId};

const CAMERA_STREAM_ID: &str = "tutorcall-camera";
const SCREEN_STREAM_ID: &str = "tutorcall-screen";

fn rtc_err(context: &str) -> impl Fn(webrtc::Error) -> Error + '_ {
    move |e| Error::WebRtc(format!("{}: {}", context, e))
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

/// Builds `RTCPeerConnection`s sharing one media engine and interceptor setup.
pub struct RtcPeerFactory {
    ice_servers: Vec<IceServerConfig>,
    api: OnceCell<Arc<API>>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            ice_servers,
            api: OnceCell::new(),
        }
    }

    fn build_api() -> Result<API> {
        let mut media_engine = WrtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::LibraryLoad(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| Error::LibraryLoad(format!("Failed to register interceptors: {}", e)))?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn prepare(&self) -> Result<()> {
        self.api
            .get_or_try_init(|| async { Self::build_api().map(Arc::new) })
            .await?;
        info!("WebRTC peer connection library ready");
        Ok(())
    }

    async fn create(
        &self,
        remote: UserId,
        role: PeerRole,
        seed_tracks: &[MediaTrack],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerLink>> {
        let api = self
            .api
            .get()
            .ok_or_else(|| Error::LibraryLoad("peer connection library not loaded".into()))?;

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(rtc_err("Failed to create peer connection"))?,
        );

        let link = Arc::new(RtcPeerLink {
            user_id: remote,
            role,
            pc,
            events,
            senders: Mutex::new(HashMap::new()),
            pending_candidates: Mutex::new(Vec::new()),
        });
        link.install_handlers();

        for track in seed_tracks {
            link.attach(track).await?;
        }

        if role == PeerRole::Initiator {
            link.send_offer().await?;
        }

        info!("Created WebRTC peer connection for user {} as {:?}", remote, role);
        Ok(link)
    }
}

struct LocalSender {
    rtp_sender: Arc<RTCRtpSender>,
    local: Arc<TrackLocalStaticSample>,
}

/// One `RTCPeerConnection` to a remote participant.
pub struct RtcPeerLink {
    user_id: UserId,
    role: PeerRole,
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
    /// Local track id -> sender carrying it.
    senders: Mutex<HashMap<String, LocalSender>>,
    /// Candidates that arrived before the remote description.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl RtcPeerLink {
    fn install_handlers(&self) {
        let user_id = self.user_id;

        let tx = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    info!("WebRTC connection to user {} state: {}", user_id, state);
                    let _ = tx.send(PeerEvent::StateChanged {
                        user_id,
                        state: peer_state(state),
                    });
                })
            }));

        let tx = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("Failed to serialize ICE candidate: {}", e);
                        return;
                    }
                };
                let signal = PeerSignal::Candidate {
                    candidate: IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    },
                };
                let _ = tx.send(PeerEvent::Signal { user_id, signal });
            })
        }));

        let tx = self.events.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                info!("Received remote {} track from user {}", kind, user_id);
                let stream = RemoteStream {
                    id: track.stream_id().to_string(),
                    tracks: vec![RemoteTrack {
                        id: track.id().to_string(),
                        kind,
                    }],
                };
                let _ = tx.send(PeerEvent::RemoteStream { user_id, stream });
            })
        }));
    }

    fn emit(&self, signal: PeerSignal) {
        let event = PeerEvent::Signal {
            user_id: self.user_id,
            signal,
        };
        if self.events.send(event).is_err() {
            debug!("Dropping signal for user {}: session engine gone", self.user_id);
        }
    }

    async fn send_offer(&self) -> Result<()> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(rtc_err("Failed to create offer"))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_err("Failed to set local description"))?;
        debug!("Sending offer to user {}", self.user_id);
        self.emit(PeerSignal::offer(offer.sdp));
        Ok(())
    }

    /// Ask for a fresh offer after the set of outgoing tracks changed.
    async fn renegotiate(&self) -> Result<()> {
        match self.role {
            PeerRole::Initiator => self.send_offer().await,
            PeerRole::Responder => {
                self.emit(PeerSignal::renegotiate());
                Ok(())
            }
        }
    }

    async fn flush_pending_candidates(&self) {
        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock().await);
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!("Failed to add queued ICE candidate from user {}: {}", self.user_id, e);
            }
        }
    }

    async fn apply_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(rtc_err("Invalid session description"))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(rtc_err("Failed to set remote description"))?;
        self.flush_pending_candidates().await;

        if kind == SdpKind::Offer {
            let answer = self
                .pc
                .create_answer(None)
                .await
                .map_err(rtc_err("Failed to create answer"))?;
            self.pc
                .set_local_description(answer.clone())
                .await
                .map_err(rtc_err("Failed to set local description"))?;
            debug!("Sending answer to user {}", self.user_id);
            self.emit(PeerSignal::answer(answer.sdp));
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        if self.pc.remote_description().await.is_none() {
            self.pending_candidates.lock().await.push(init);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(rtc_err("Failed to add ICE candidate"))
    }

    /// Add a sender for `track` without renegotiating.
    async fn attach(&self, track: &MediaTrack) -> Result<()> {
        let stream_id = match track.source() {
            TrackSource::Screen => SCREEN_STREAM_ID,
            _ => CAMERA_STREAM_ID,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            stream_id.to_string(),
        ));
        let rtp_sender = self
            .pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err("Failed to add track"))?;

        // Read incoming RTCP packets (needed by webrtc crate for proper operation)
        let rtcp_sender = rtp_sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders
            .lock()
            .await
            .insert(track.id().to_string(), LocalSender { rtp_sender, local });
        Ok(())
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn signal(&self, signal: PeerSignal) -> Result<()> {
        match signal {
            PeerSignal::Description { kind, sdp } => self.apply_description(kind, sdp).await,
            PeerSignal::Candidate { candidate } => self.apply_candidate(candidate).await,
            PeerSignal::Renegotiate { renegotiate } => {
                if renegotiate && self.role == PeerRole::Initiator {
                    self.send_offer().await
                } else {
                    debug!("Ignoring renegotiate request from user {}", self.user_id);
                    Ok(())
                }
            }
        }
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        self.attach(track).await?;
        self.renegotiate().await
    }

    async fn remove_track(&self, track: &MediaTrack) -> Result<()> {
        let removed = self.senders.lock().await.remove(track.id());
        let Some(sender) = removed else {
            return Ok(());
        };
        self.pc
            .remove_track(&sender.rtp_sender)
            .await
            .map_err(rtc_err("Failed to remove track"))?;
        self.renegotiate().await
    }

    async fn replace_track(&self, old: Option<&MediaTrack>, new: Option<&MediaTrack>) -> Result<()> {
        match (old, new) {
            (Some(old), Some(new)) => {
                let mut senders = self.senders.lock().await;
                let Some(sender) = senders.remove(old.id()) else {
                    drop(senders);
                    return self.add_track(new).await;
                };
                let local = Arc::new(TrackLocalStaticSample::new(
                    codec_for(new.kind()),
                    new.id().to_string(),
                    sender.local.stream_id().to_string(),
                ));
                sender
                    .rtp_sender
                    .replace_track(Some(local.clone() as Arc<dyn TrackLocal + Send + Sync>))
                    .await
                    .map_err(rtc_err("Failed to replace track"))?;
                senders.insert(
                    new.id().to_string(),
                    LocalSender {
                        rtp_sender: sender.rtp_sender,
                        local,
                    },
                );
                Ok(())
            }
            (Some(old), None) => self.remove_track(old).await,
            (None, Some(new)) => self.add_track(new).await,
            (None, None) => Ok(()),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection to user {}: {}", self.user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> PeerSignal {
        loop {
            let event = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for signal")
                .expect("event channel closed");
            if let PeerEvent::Signal { signal, .. } = event {
                return signal;
            }
        }
    }

    async fn next_description(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> (SdpKind, String) {
        loop {
            if let PeerSignal::Description { kind, sdp } = next_signal(rx).await {
                return (kind, sdp);
            }
        }
    }

    #[tokio::test]
    async fn create_before_prepare_is_a_library_error() {
        let factory = RtcPeerFactory::new(vec![]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = factory.create(1, PeerRole::Initiator, &[], tx).await;
        assert!(matches!(result, Err(Error::LibraryLoad(_))));
    }

    #[tokio::test]
    async fn initiator_offers_and_responder_answers() {
        let factory = RtcPeerFactory::new(vec![]);
        factory.prepare().await.unwrap();
        factory.prepare().await.unwrap();

        let mic = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let a = factory
            .create(2, PeerRole::Initiator, &[mic.clone()], a_tx)
            .await
            .unwrap();
        let (kind, offer) = next_description(&mut a_rx).await;
        assert_eq!(kind, SdpKind::Offer);
        assert!(offer.contains("m=audio"));

        let b = factory.create(1, PeerRole::Responder, &[], b_tx).await.unwrap();
        b.signal(PeerSignal::offer(offer)).await.unwrap();
        let (kind, answer) = next_description(&mut b_rx).await;
        assert_eq!(kind, SdpKind::Answer);
        a.signal(PeerSignal::answer(answer)).await.unwrap();

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn responder_requests_renegotiation_when_tracks_change() {
        let factory = RtcPeerFactory::new(vec![]);
        factory.prepare().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = factory.create(9, PeerRole::Responder, &[], tx).await.unwrap();

        let cam = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        link.add_track(&cam).await.unwrap();
        loop {
            if let PeerSignal::Renegotiate { renegotiate } = next_signal(&mut rx).await {
                assert!(renegotiate);
                break;
            }
        }
        link.close().await;
    }

    #[tokio::test]
    async fn early_candidates_are_queued() {
        let factory = RtcPeerFactory::new(vec![]);
        factory.prepare().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.create(3, PeerRole::Responder, &[], tx).await.unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        link.signal(PeerSignal::Candidate { candidate }).await.unwrap();
        link.close().await;
    }
}
