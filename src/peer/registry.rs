use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{PeerEventSender, PeerFactory, PeerLink, PeerRole, PeerState, RemoteStream};
use crate::error::{Error, Result};
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::UserId;

/// Registry bookkeeping for one remote participant.
pub struct PeerEntry {
    link: Arc<dyn PeerLink>,
    pub role: PeerRole,
    /// Distinguishes this entry from an earlier one for the same user.
    pub generation: u64,
    pub state: PeerState,
    pub user_name: Option<String>,
    pub streams: Vec<RemoteStream>,
    pub screen_sharing: bool,
    outgoing_audio: Option<MediaTrack>,
    outgoing_video: Option<MediaTrack>,
}

impl PeerEntry {
    pub fn link(&self) -> Arc<dyn PeerLink> {
        self.link.clone()
    }

    pub fn outgoing(&self, kind: TrackKind) -> Option<&MediaTrack> {
        match kind {
            TrackKind::Audio => self.outgoing_audio.as_ref(),
            TrackKind::Video => self.outgoing_video.as_ref(),
        }
    }

    fn outgoing_slot(&mut self, kind: TrackKind) -> &mut Option<MediaTrack> {
        match kind {
            TrackKind::Audio => &mut self.outgoing_audio,
            TrackKind::Video => &mut self.outgoing_video,
        }
    }
}

/// Result of [`PeerRegistry::ensure_peer`].
pub struct EnsuredPeer {
    pub link: Arc<dyn PeerLink>,
    pub generation: u64,
    pub created: bool,
}

/// A track operation that failed on one peer. Other peers are unaffected.
#[derive(Debug)]
pub struct PeerFailure {
    pub user_id: UserId,
    pub error: Error,
}

/// Remote user id → peer connection, plus the outgoing local tracks every peer
/// should carry.
pub struct PeerRegistry {
    factory: Arc<dyn PeerFactory>,
    events: PeerEventSender,
    peers: HashMap<UserId, PeerEntry>,
    local_audio: Option<MediaTrack>,
    local_video: Option<MediaTrack>,
    next_generation: u64,
}

impl PeerRegistry {
    pub fn new(factory: Arc<dyn PeerFactory>, events: PeerEventSender) -> Self {
        Self {
            factory,
            events,
            peers: HashMap::new(),
            local_audio: None,
            local_video: None,
            next_generation: 1,
        }
    }

    /// Return the entry for `remote`, creating it (seeded with the current
    /// outgoing tracks) if it does not exist. `role` only matters on creation.
    pub async fn ensure_peer(&mut self, remote: UserId, role: PeerRole) -> Result<EnsuredPeer> {
        if let Some(entry) = self.peers.get(&remote) {
            return Ok(EnsuredPeer {
                link: entry.link.clone(),
                generation: entry.generation,
                created: false,
            });
        }

        let outgoing_audio = self.local_audio.clone().filter(|t| t.is_live());
        let outgoing_video = self.local_video.clone().filter(|t| t.is_live());
        let seed: Vec<MediaTrack> = outgoing_audio
            .iter()
            .chain(outgoing_video.iter())
            .cloned()
            .collect();

        let link = self
            .factory
            .create(remote, role, &seed, self.events.clone())
            .await?;

        let generation = self.next_generation;
        self.next_generation += 1;
        self.peers.insert(
            remote,
            PeerEntry {
                link: link.clone(),
                role,
                generation,
                state: PeerState::New,
                user_name: None,
                streams: Vec::new(),
                screen_sharing: false,
                outgoing_audio,
                outgoing_video,
            },
        );
        info!(
            "Registered {:?} peer connection for user {} ({} seed tracks)",
            role,
            remote,
            seed.len()
        );

        Ok(EnsuredPeer {
            link,
            generation,
            created: true,
        })
    }

    /// Close and unregister the connection to `remote`.
    pub async fn remove_peer(&mut self, remote: UserId) -> Option<PeerEntry> {
        let entry = self.peers.remove(&remote)?;
        entry.link.close().await;
        info!("Closed peer connection to user {}", remote);
        Some(entry)
    }

    pub async fn close_all(&mut self) {
        let ids: Vec<UserId> = self.peers.keys().copied().collect();
        for id in ids {
            self.remove_peer(id).await;
        }
    }

    /// Make `track` the outgoing track of its kind on every peer.
    pub async fn attach_local_track(&mut self, track: &MediaTrack) -> Vec<PeerFailure> {
        let kind = track.kind();
        *self.local_slot(kind) = Some(track.clone());

        let mut failures = Vec::new();
        for (user_id, entry) in self.peers.iter_mut() {
            let current = entry.outgoing(kind).cloned();
            let result = match current.as_ref() {
                Some(old) if old == track => continue,
                Some(old) => entry.link.replace_track(Some(old), Some(track)).await,
                None => entry.link.add_track(track).await,
            };
            match result {
                Ok(()) => *entry.outgoing_slot(kind) = Some(track.clone()),
                Err(error) => {
                    warn!("Failed to attach {} track to user {}: {}", kind, user_id, error);
                    failures.push(PeerFailure {
                        user_id: *user_id,
                        error,
                    });
                }
            }
        }
        failures
    }

    /// Stop sending any track of `kind` to every peer.
    pub async fn detach_local_track(&mut self, kind: TrackKind) -> Vec<PeerFailure> {
        self.local_slot(kind).take();

        let mut failures = Vec::new();
        for (user_id, entry) in self.peers.iter_mut() {
            let Some(old) = entry.outgoing_slot(kind).take() else {
                continue;
            };
            if let Err(error) = entry.link.remove_track(&old).await {
                warn!("Failed to detach {} track from user {}: {}", kind, user_id, error);
                failures.push(PeerFailure {
                    user_id: *user_id,
                    error,
                });
            }
        }
        failures
    }

    /// Swap the outgoing video track on every peer. Audio is untouched.
    pub async fn replace_video_track(&mut self, new: Option<&MediaTrack>) -> Vec<PeerFailure> {
        self.local_video = new.cloned();

        let mut failures = Vec::new();
        for (user_id, entry) in self.peers.iter_mut() {
            let old = entry.outgoing_video.clone();
            if old.as_ref() == new {
                continue;
            }
            match entry.link.replace_track(old.as_ref(), new).await {
                Ok(()) => entry.outgoing_video = new.cloned(),
                Err(error) => {
                    warn!("Failed to replace video track for user {}: {}", user_id, error);
                    failures.push(PeerFailure {
                        user_id: *user_id,
                        error,
                    });
                }
            }
        }
        debug!(
            "Outgoing video is now {}",
            new.map(|t| t.label()).unwrap_or("absent")
        );
        failures
    }

    /// The track every peer should currently be sending for `kind`.
    pub fn local_track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        match kind {
            TrackKind::Audio => self.local_audio.as_ref(),
            TrackKind::Video => self.local_video.as_ref(),
        }
    }

    fn local_slot(&mut self, kind: TrackKind) -> &mut Option<MediaTrack> {
        match kind {
            TrackKind::Audio => &mut self.local_audio,
            TrackKind::Video => &mut self.local_video,
        }
    }

    pub fn get(&self, remote: UserId) -> Option<&PeerEntry> {
        self.peers.get(&remote)
    }

    pub fn get_mut(&mut self, remote: UserId) -> Option<&mut PeerEntry> {
        self.peers.get_mut(&remote)
    }

    pub fn contains(&self, remote: UserId) -> bool {
        self.peers.contains_key(&remote)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Registered remote user ids in ascending order.
    pub fn peer_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Forget local tracks without touching peers (used once every peer is gone).
    pub fn clear_local_tracks(&mut self) {
        self.local_audio = None;
        self.local_video = None;
    }
}
