pub mod engine;

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{Observers, SessionObserver};
use crate::media::{MediaDevices, MediaStream};
use crate::peer::rtc::RtcPeerFactory;
use crate::peer::PeerFactory;
use crate::signaling::UserId;
use crate::transport::{SignalingConnector, WsConnector};

/// Coordinator lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Connecting,
    Ready,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "uninitialized"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Observable session state, published after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub user_id: Option<UserId>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub peers: Vec<UserId>,
    pub remote_peers: Vec<RemotePeer>,
}

/// What the session knows about one connected remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub user_id: UserId,
    /// Known once a `user_joined` frame named them.
    pub user_name: Option<String>,
    pub screen_sharing: bool,
}

/// Commands processed one at a time by the session engine.
pub(crate) enum SessionCommand {
    Initialize {
        session_id: String,
        user_id: UserId,
        token: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleAudio {
        enable: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    ToggleVideo {
        enable: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<()>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<()>>,
    },
    SendChat {
        message: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SendHandRaise {
        raised: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    LocalStream {
        reply: oneshot::Sender<Option<MediaStream>>,
    },
    Cleanup {
        reply: oneshot::Sender<()>,
    },
}

/// Collaborators injected into a coordinator.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn SignalingConnector>,
    pub peers: Arc<dyn PeerFactory>,
    pub media: Arc<dyn MediaDevices>,
}

impl SessionDeps {
    /// WebSocket signaling and `webrtc` peer connections from `config`.
    pub fn from_config(config: &SessionConfig, media: Arc<dyn MediaDevices>) -> Self {
        Self {
            connector: Arc::new(WsConnector::new(config.signaling_url.clone())),
            peers: Arc::new(RtcPeerFactory::new(config.ice_servers.clone())),
            media,
        }
    }
}

/// Owner-side handle to one live session.
///
/// All mutations run on a dedicated engine task in the order they were
/// requested, so concurrent toggles never interleave. Dropping the handle
/// tears the session down.
pub struct SessionCoordinator {
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionSnapshot>,
    observers: Observers,
}

impl SessionCoordinator {
    /// Create a coordinator and spawn its engine. Must be called within a tokio runtime.
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        let observers = Observers::default();

        let engine = engine::SessionEngine::new(config, deps, observers.clone(), state_tx, cmd_rx);
        tokio::spawn(engine.run());

        Self {
            cmd_tx,
            state_rx,
            observers,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(make(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Load the peer library, connect and authenticate, then acquire camera
    /// and microphone. Media failure is not fatal.
    pub async fn initialize(&self, session_id: &str, user_id: UserId, token: &str) -> Result<()> {
        self.request(|reply| SessionCommand::Initialize {
            session_id: session_id.to_string(),
            user_id,
            token: token.to_string(),
            reply,
        })
        .await
        .unwrap_or(Err(Error::Closed))
    }

    /// Enable or mute the microphone. Returns the resulting enabled state.
    pub async fn toggle_audio(&self, enable: bool) -> Result<bool> {
        self.request(|reply| SessionCommand::ToggleAudio { enable, reply })
            .await
            .unwrap_or(Err(Error::Closed))
    }

    /// Enable or disable the camera. Returns the resulting enabled state.
    pub async fn toggle_video(&self, enable: bool) -> Result<bool> {
        self.request(|reply| SessionCommand::ToggleVideo { enable, reply })
            .await
            .unwrap_or(Err(Error::Closed))
    }

    pub async fn start_screen_sharing(&self) -> Result<()> {
        self.request(|reply| SessionCommand::StartScreenShare { reply })
            .await
            .unwrap_or(Err(Error::Closed))
    }

    pub async fn stop_screen_sharing(&self) -> Result<()> {
        self.request(|reply| SessionCommand::StopScreenShare { reply })
            .await
            .unwrap_or(Err(Error::Closed))
    }

    pub async fn send_chat_message(&self, message: &str) -> Result<()> {
        self.request(|reply| SessionCommand::SendChat {
            message: message.to_string(),
            reply,
        })
        .await
        .unwrap_or(Err(Error::Closed))
    }

    pub async fn send_hand_raise_update(&self, raised: bool) -> Result<()> {
        self.request(|reply| SessionCommand::SendHandRaise { raised, reply })
            .await
            .unwrap_or(Err(Error::Closed))
    }

    /// Replace every subscriber with `observer` (last write wins).
    pub fn set_callbacks(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.replace_all(observer);
    }

    /// Add a subscriber next to the existing ones.
    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.add(observer);
    }

    /// Stop local media, close every peer and the transport. Idempotent.
    pub async fn cleanup(&self) {
        let _ = self.request(|reply| SessionCommand::Cleanup { reply }).await;
    }

    /// The local camera/microphone stream, if one is held.
    pub async fn current_local_stream(&self) -> Option<MediaStream> {
        self.request(|reply| SessionCommand::LocalStream { reply })
            .await
            .flatten()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }

    /// Watch the published snapshot.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().state
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.state_rx.borrow().audio_enabled
    }

    pub fn is_video_enabled(&self) -> bool {
        self.state_rx.borrow().video_enabled
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.state_rx.borrow().screen_sharing
    }

    pub fn peer_ids(&self) -> Vec<UserId> {
        self.state_rx.borrow().peers.clone()
    }

    pub fn remote_peer(&self, user_id: UserId) -> Option<RemotePeer> {
        self.state_rx
            .borrow()
            .remote_peers
            .iter()
            .find(|p| p.user_id == user_id)
            .cloned()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state_rx.borrow().session_id.clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.state_rx.borrow().user_id
    }
}
