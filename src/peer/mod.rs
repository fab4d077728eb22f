pub mod registry;
pub mod rtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{PeerSignal, UserId};

/// Which side drives negotiation for a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Created on "user joined"; sends the first offer.
    Initiator,
    /// Created for a signal from an unknown peer; answers.
    Responder,
}

/// Connection state reported by a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::New => write!(f, "new"),
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// A track received from a remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Media received from a remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Events emitted by peer links back to the session engine.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Negotiation data that must be relayed to the remote peer.
    Signal { user_id: UserId, signal: PeerSignal },
    RemoteStream { user_id: UserId, stream: RemoteStream },
    StateChanged { user_id: UserId, state: PeerState },
    Error { user_id: UserId, reason: String },
    /// The peer did not connect within the configured handshake timeout.
    HandshakeTimeout { user_id: UserId, generation: u64 },
}

/// Unbounded so a link never waits on the engine that is driving it.
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// One live connection to a remote participant.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Apply negotiation data relayed from the remote peer.
    async fn signal(&self, signal: PeerSignal) -> Result<()>;

    async fn add_track(&self, track: &MediaTrack) -> Result<()>;

    async fn remove_track(&self, track: &MediaTrack) -> Result<()>;

    /// Swap an outgoing track. `None` on either side means "absent".
    async fn replace_track(&self, old: Option<&MediaTrack>, new: Option<&MediaTrack>) -> Result<()>;

    async fn close(&self);
}

/// The peer-connection library, injected into the coordinator.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Load whatever the library needs. Failure is fatal to session start.
    async fn prepare(&self) -> Result<()>;

    /// Create a link to `remote`, seeded with the given outgoing tracks.
    async fn create(
        &self,
        remote: UserId,
        role: PeerRole,
        seed_tracks: &[MediaTrack],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerLink>>;
}
