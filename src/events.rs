use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::media::MediaError;
use crate::peer::RemoteStream;
use crate::signaling::UserId;

/// User-facing capability a notice is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Microphone,
    Camera,
    CameraAndMicrophone,
    ScreenShare,
}

impl Capability {
    fn label(&self) -> &'static str {
        match self {
            Capability::Microphone => "Microphone",
            Capability::Camera => "Camera",
            Capability::CameraAndMicrophone => "Camera and microphone",
            Capability::ScreenShare => "Screen share",
        }
    }
}

/// Transient, non-blocking notice for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A capture device could not be acquired.
    Media {
        capability: Capability,
        error: MediaError,
    },
    /// A capture device stopped on its own.
    DeviceEnded { capability: Capability },
    /// Something went wrong on one participant's connection.
    PeerError { user_id: UserId },
    /// A participant never finished connecting.
    PeerTimeout { user_id: UserId },
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::Media { capability, error } => {
                format!("{}: {}", capability.label(), error.user_message())
            }
            Notice::DeviceEnded { capability } => {
                format!("{} stopped unexpectedly.", capability.label())
            }
            Notice::PeerError { .. } => "Connection error with participant.".to_string(),
            Notice::PeerTimeout { .. } => "Could not connect to participant.".to_string(),
        }
    }
}

/// Receives session events. Every method defaults to a no-op, so a subscriber
/// only implements what it renders.
pub trait SessionObserver: Send + Sync {
    fn on_user_joined(&self, _user_id: UserId, _user_name: &str) {}
    fn on_user_left(&self, _user_id: UserId) {}
    fn on_stream_received(&self, _user_id: UserId, _stream: &RemoteStream) {}
    fn on_screen_share_received(&self, _user_id: UserId, _screen_sharing: bool) {}
    fn on_chat_message(&self, _user_id: UserId, _user_name: &str, _message: &str) {}
    fn on_participant_state_update(&self, _user_id: UserId, _audio_enabled: bool, _video_enabled: bool) {}
    fn on_hand_raise_update(&self, _user_id: UserId, _hand_raised: bool) {}
    fn on_notice(&self, _notice: &Notice) {}
    fn on_closed(&self, _reason: &str) {}
}

/// Shared subscriber list. Delivery happens outside the lock.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<RwLock<Vec<Arc<dyn SessionObserver>>>>,
}

impl Observers {
    /// Replace every subscriber with `observer`.
    pub fn replace_all(&self, observer: Arc<dyn SessionObserver>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = vec![observer],
            Err(e) => warn!("Observer list poisoned: {}", e),
        }
    }

    pub fn add(&self, observer: Arc<dyn SessionObserver>) {
        match self.inner.write() {
            Ok(mut guard) => guard.push(observer),
            Err(e) => warn!("Observer list poisoned: {}", e),
        }
    }

    pub fn emit(&self, f: impl Fn(&dyn SessionObserver)) {
        let snapshot: Vec<Arc<dyn SessionObserver>> = match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for observer in snapshot {
            f(observer.as_ref());
        }
    }
}

/// Session events as values.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    UserJoined { user_id: UserId, user_name: String },
    UserLeft { user_id: UserId },
    StreamReceived { user_id: UserId, stream: RemoteStream },
    ScreenShareReceived { user_id: UserId, screen_sharing: bool },
    ChatMessage { user_id: UserId, user_name: String, message: String },
    ParticipantStateUpdate { user_id: UserId, audio_enabled: bool, video_enabled: bool },
    HandRaiseUpdate { user_id: UserId, hand_raised: bool },
    Notice(Notice),
    Closed { reason: String },
}

/// Observer that forwards every event into a channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

impl SessionObserver for ChannelObserver {
    fn on_user_joined(&self, user_id: UserId, user_name: &str) {
        self.forward(SessionEvent::UserJoined {
            user_id,
            user_name: user_name.to_string(),
        });
    }

    fn on_user_left(&self, user_id: UserId) {
        self.forward(SessionEvent::UserLeft { user_id });
    }

    fn on_stream_received(&self, user_id: UserId, stream: &RemoteStream) {
        self.forward(SessionEvent::StreamReceived {
            user_id,
            stream: stream.clone(),
        });
    }

    fn on_screen_share_received(&self, user_id: UserId, screen_sharing: bool) {
        self.forward(SessionEvent::ScreenShareReceived {
            user_id,
            screen_sharing,
        });
    }

    fn on_chat_message(&self, user_id: UserId, user_name: &str, message: &str) {
        self.forward(SessionEvent::ChatMessage {
            user_id,
            user_name: user_name.to_string(),
            message: message.to_string(),
        });
    }

    fn on_participant_state_update(&self, user_id: UserId, audio_enabled: bool, video_enabled: bool) {
        self.forward(SessionEvent::ParticipantStateUpdate {
            user_id,
            audio_enabled,
            video_enabled,
        });
    }

    fn on_hand_raise_update(&self, user_id: UserId, hand_raised: bool) {
        self.forward(SessionEvent::HandRaiseUpdate {
            user_id,
            hand_raised,
        });
    }

    fn on_notice(&self, notice: &Notice) {
        self.forward(SessionEvent::Notice(notice.clone()));
    }

    fn on_closed(&self, reason: &str) {
        self.forward(SessionEvent::Closed {
            reason: reason.to_string(),
        });
    }
}
