use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// STUN/TURN server entry handed to the peer-connection library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Ideal capture resolution requested with every camera acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDefaults {
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for MediaDefaults {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
        }
    }
}

/// Client configuration for one live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base WebSocket URL of the signaling server, e.g. `ws://127.0.0.1:9850`.
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub media: MediaDefaults,
    /// Seconds a peer may stay unconnected before it is dropped. `None` waits forever.
    pub handshake_timeout_secs: Option<u64>,
    pub command_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:9850".to_string(),
            ice_servers: vec![IceServerConfig {
                urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
                username: String::new(),
                credential: String::new(),
            }],
            media: MediaDefaults::default(),
            handshake_timeout_secs: Some(30),
            command_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
