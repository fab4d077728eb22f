use thiserror::Error;

use crate::media::MediaError;
use crate::signaling::UserId;

/// Errors surfaced by the session coordinator and its collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// The peer-connection library could not be loaded. Fatal to `initialize`.
    #[error("Peer connection library failed to load: {0}")]
    LibraryLoad(String),

    /// The signaling socket could not be opened. Fatal to `initialize`.
    #[error("Signaling connect failed: {0}")]
    TransportConnect(String),

    #[error("Signaling transport closed")]
    TransportClosed,

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Peer error [{user_id}]: {reason}")]
    Peer { user_id: UserId, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Session closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(String),
}

impl Error {
    pub fn peer(user_id: UserId, reason: impl Into<String>) -> Self {
        Error::Peer {
            user_id,
            reason: reason.into(),
        }
    }

    /// Fatal errors end the session; everything else is reported as a notice.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::LibraryLoad(_) | Error::TransportConnect(_) | Error::Closed
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
