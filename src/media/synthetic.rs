//! Device backends that need no capture hardware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::{MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind, TrackSource};

#[derive(Debug)]
struct DeviceState {
    has_camera: bool,
    has_microphone: bool,
    has_display: bool,
    permission_granted: bool,
    camera_busy: bool,
    fail_next: Option<MediaError>,
}

/// Test-pattern camera, silent microphone and a fake display.
///
/// Presence, permission and busy state can be changed at runtime; clones share
/// state so a caller can keep a handle after passing one to a coordinator.
#[derive(Clone)]
pub struct SyntheticDevices {
    state: Arc<Mutex<DeviceState>>,
    live_hardware: Arc<AtomicUsize>,
    user_media_requests: Arc<AtomicUsize>,
    display_requests: Arc<AtomicUsize>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                has_camera: true,
                has_microphone: true,
                has_display: true,
                permission_granted: true,
                camera_busy: false,
                fail_next: None,
            })),
            live_hardware: Arc::new(AtomicUsize::new(0)),
            user_media_requests: Arc::new(AtomicUsize::new(0)),
            display_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn update(&self, f: impl FnOnce(&mut DeviceState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }

    pub fn without_camera(self) -> Self {
        self.update(|s| s.has_camera = false);
        self
    }

    pub fn without_microphone(self) -> Self {
        self.update(|s| s.has_microphone = false);
        self
    }

    pub fn without_display(self) -> Self {
        self.update(|s| s.has_display = false);
        self
    }

    pub fn set_permission(&self, granted: bool) {
        self.update(|s| s.permission_granted = granted);
    }

    pub fn set_camera_busy(&self, busy: bool) {
        self.update(|s| s.camera_busy = busy);
    }

    /// Fail the next acquisition (user or display) with `error`.
    pub fn fail_next(&self, error: MediaError) {
        self.update(|s| s.fail_next = Some(error));
    }

    /// Tracks currently holding "hardware" (acquired and not yet stopped).
    pub fn live_hardware_tracks(&self) -> usize {
        self.live_hardware.load(Ordering::SeqCst)
    }

    pub fn user_media_requests(&self) -> usize {
        self.user_media_requests.load(Ordering::SeqCst)
    }

    pub fn display_requests(&self) -> usize {
        self.display_requests.load(Ordering::SeqCst)
    }

    fn hardware_track(&self, kind: TrackKind, source: TrackSource, label: String) -> MediaTrack {
        self.live_hardware.fetch_add(1, Ordering::SeqCst);
        let live = self.live_hardware.clone();
        MediaTrack::new(kind, source, label).with_release(move || {
            live.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn check(&self, f: impl FnOnce(&DeviceState) -> Result<(), MediaError>) -> Result<(), MediaError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| MediaError::Unknown("device state poisoned".into()))?;
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        f(&state)
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);
        self.check(|s| {
            if !s.permission_granted {
                return Err(MediaError::PermissionDenied);
            }
            if (constraints.video && !s.has_camera) || (constraints.audio && !s.has_microphone) {
                return Err(MediaError::DeviceNotFound);
            }
            if constraints.video && s.camera_busy {
                return Err(MediaError::DeviceBusy);
            }
            Ok(())
        })?;

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.hardware_track(
                TrackKind::Audio,
                TrackSource::Microphone,
                "Synthetic Microphone".to_string(),
            ));
        }
        if constraints.video {
            tracks.push(self.hardware_track(
                TrackKind::Video,
                TrackSource::Camera,
                format!(
                    "Synthetic Camera {}x{}",
                    constraints.ideal_width, constraints.ideal_height
                ),
            ));
        }
        debug!("Synthetic user media: {} tracks", tracks.len());
        Ok(MediaStream::new(tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        self.display_requests.fetch_add(1, Ordering::SeqCst);
        self.check(|s| {
            if !s.has_display {
                return Err(MediaError::Unavailable);
            }
            if !s.permission_granted {
                return Err(MediaError::PermissionDenied);
            }
            Ok(())
        })?;
        let track = self.hardware_track(
            TrackKind::Video,
            TrackSource::Screen,
            "Synthetic Display".to_string(),
        );
        Ok(MediaStream::new(vec![track]))
    }
}

/// Backend for contexts without any capture API.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDevices;

#[async_trait]
impl MediaDevices for NoDevices {
    async fn get_user_media(&self, _constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        Err(MediaError::Unavailable)
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        Err(MediaError::Unavailable)
    }
}
