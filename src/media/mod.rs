pub mod synthetic;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MediaDefaults;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Where a local track comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// Classified acquisition failure. None of these are retried without user action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("device not found")]
    DeviceNotFound,
    #[error("device busy")]
    DeviceBusy,
    #[error("media devices unavailable")]
    Unavailable,
    #[error("unknown media error: {0}")]
    Unknown(String),
}

impl MediaError {
    /// Message shown to the user for this failure.
    pub fn user_message(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied => {
                "Camera or microphone access was denied. Allow access in your browser settings and try again."
            }
            MediaError::DeviceNotFound => {
                "No camera or microphone was found. Connect a device and try again."
            }
            MediaError::DeviceBusy => {
                "Your camera or microphone is being used by another application."
            }
            MediaError::Unavailable => "Media devices are not available in this environment.",
            MediaError::Unknown(_) => "Could not access your camera or microphone.",
        }
    }

    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Requested media for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl MediaConstraints {
    pub fn new(audio: bool, video: bool, defaults: &MediaDefaults) -> Self {
        Self {
            audio,
            video,
            ideal_width: defaults.ideal_width,
            ideal_height: defaults.ideal_height,
        }
    }

    pub fn audio_only(defaults: &MediaDefaults) -> Self {
        Self::new(true, false, defaults)
    }

    pub fn video_only(defaults: &MediaDefaults) -> Self {
        Self::new(false, true, defaults)
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    ended_tx: watch::Sender<bool>,
    release: Mutex<Option<ReleaseHook>>,
}

/// A local capture track. Clones share the same underlying track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended_tx,
                release: Mutex::new(None),
            }),
        }
    }

    /// Attach a hook that releases the capture hardware when the track stops.
    pub fn with_release<F>(self, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        if let Ok(mut guard) = self.inner.release.lock() {
            *guard = Some(Box::new(release));
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// True until the track is stopped locally or ended by its source.
    pub fn is_live(&self) -> bool {
        !*self.inner.ended_tx.borrow()
    }

    /// Stop the track and release its hardware. Idempotent.
    pub fn stop(&self) {
        self.finish();
    }

    /// The source ended the track (device unplugged, native "stop sharing" control).
    pub fn end(&self) {
        if self.is_live() {
            info!("{} track {} ended by its source", self.inner.kind, self.inner.label);
        }
        self.finish();
    }

    /// Resolves once the track is no longer live.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended_tx.subscribe();
        // The sender lives inside `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|ended| *ended).await;
    }

    fn finish(&self) {
        self.inner.ended_tx.send_replace(true);
        let hook = match self.inner.release.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(release) = hook {
            release();
        }
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// A set of local tracks acquired together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// First live track of the given kind.
    pub fn live_track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks
            .iter()
            .find(|t| t.kind() == kind && t.is_live())
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.contains(&track) {
            self.tracks.push(track);
        }
    }

    pub fn remove_track(&mut self, id: &str) -> Option<MediaTrack> {
        let pos = self.tracks.iter().position(|t| t.id() == id)?;
        Some(self.tracks.remove(pos))
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Stop every track in the stream.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Access to capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera and/or microphone capture.
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;

    /// Display (screen/window) capture.
    async fn get_display_media(&self) -> Result<MediaStream, MediaError>;
}

/// Acquire camera/microphone media, logging the outcome.
pub async fn acquire(
    devices: &dyn MediaDevices,
    constraints: MediaConstraints,
) -> Result<MediaStream, MediaError> {
    if !constraints.audio && !constraints.video {
        return Err(MediaError::Unknown("no audio or video requested".into()));
    }
    match devices.get_user_media(constraints).await {
        Ok(stream) => {
            info!(
                "Acquired local media (audio={}, video={}, {} tracks)",
                constraints.audio,
                constraints.video,
                stream.tracks().len()
            );
            Ok(stream)
        }
        Err(e) => {
            warn!("Media acquisition failed: {}", e);
            Err(e)
        }
    }
}

/// Acquire a display-capture stream, logging the outcome.
pub async fn acquire_display(devices: &dyn MediaDevices) -> Result<MediaStream, MediaError> {
    match devices.get_display_media().await {
        Ok(stream) => {
            info!("Acquired display capture stream {}", stream.id());
            Ok(stream)
        }
        Err(e) => {
            warn!("Display capture failed: {}", e);
            Err(e)
        }
    }
}
