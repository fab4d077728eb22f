use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::Participant;
use crate::signaling::{InboundFrame, UserId};

/// One live socket in a room.
pub struct RelayMember {
    pub participant: Participant,
    pub connection_id: Uuid,
    pub tx: mpsc::UnboundedSender<String>,
}

/// Who should receive a relayed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    Others(UserId),
    Only(UserId),
}

/// Shared relay state: session id -> connected members.
#[derive(Clone, Default)]
pub struct RelayContext {
    rooms: Arc<TokioMutex<HashMap<String, HashMap<UserId, RelayMember>>>>,
}

impl RelayContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. A second socket for the same user replaces the first.
    pub async fn join(
        &self,
        session_id: &str,
        participant: Participant,
        tx: mpsc::UnboundedSender<String>,
    ) -> Uuid {
        let connection_id = Uuid::new_v4();
        let user_id = participant.user_id;
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(session_id.to_string()).or_default();
        if room.contains_key(&user_id) {
            warn!("User {} reconnected to session {}, replacing old socket", user_id, session_id);
        }
        room.insert(
            user_id,
            RelayMember {
                participant,
                connection_id,
                tx,
            },
        );
        info!("User {} joined session {} ({} connected)", user_id, session_id, room.len());
        connection_id
    }

    /// Unregister a socket. Returns false if a newer socket already took its place.
    pub async fn leave(&self, session_id: &str, user_id: UserId, connection_id: Uuid) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(session_id) else {
            return false;
        };
        match room.get(&user_id) {
            Some(member) if member.connection_id == connection_id => {
                room.remove(&user_id);
            }
            _ => return false,
        }
        info!("User {} left session {}", user_id, session_id);
        if room.is_empty() {
            rooms.remove(session_id);
            debug!("Session {} has no connected users", session_id);
        }
        true
    }

    /// Connected participants, earliest arrival first.
    pub async fn roster(&self, session_id: &str) -> Vec<Participant> {
        let rooms = self.rooms.lock().await;
        let mut participants: Vec<Participant> = rooms
            .get(session_id)
            .map(|room| room.values().map(|m| m.participant.clone()).collect())
            .unwrap_or_default();
        participants.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then(a.user_id.cmp(&b.user_id))
        });
        participants
    }

    /// Deliver `frame` to `audience` within a session. Returns the number of sockets reached.
    pub async fn deliver(&self, session_id: &str, audience: Audience, frame: &InboundFrame) -> usize {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize relay frame: {}", e);
                return 0;
            }
        };

        let rooms = self.rooms.lock().await;
        let Some(room) = rooms.get(session_id) else {
            return 0;
        };
        room.iter()
            .filter(|(user_id, _)| match audience {
                Audience::Everyone => true,
                Audience::Others(sender) => **user_id != sender,
                Audience::Only(target) => **user_id == target,
            })
            .filter(|(_, member)| member.tx.send(text.clone()).is_ok())
            .count()
    }
}
