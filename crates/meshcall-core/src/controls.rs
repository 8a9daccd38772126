use crate::errors::MeshError;
use crate::events::{EventEmitter, MeshEvent};
use crate::media::{LocalStream, MediaBackend};
use crate::protocol::{ClientMessage, MediaKind};
use crate::signaling::{self, Outbound};

/// Controls for local media (microphone, camera).
///
/// Owns the capture stream for the whole session. Toggling a track flips its
/// enabled flag, which every peer link observes through its shared handle, and
/// broadcasts the new state so remote rosters can follow. The broadcast is
/// fire-and-forget.
pub struct LocalMediaController {
    stream: Option<LocalStream>,
    emitter: EventEmitter,
    room_id: String,
    outbound: Option<Outbound>,
}

impl LocalMediaController {
    pub fn new(room_id: impl Into<String>, emitter: EventEmitter) -> Self {
        Self {
            stream: None,
            emitter,
            room_id: room_id.into(),
            outbound: None,
        }
    }

    /// Acquire the capture stream from the backend.
    pub async fn acquire(&mut self, backend: &dyn MediaBackend) -> Result<LocalStream, MeshError> {
        if let Some(stream) = &self.stream {
            return Ok(stream.clone());
        }
        let stream = backend.acquire().await?;
        tracing::info!(
            "local media acquired: {} track(s) in stream {}",
            stream.tracks().len(),
            stream.id()
        );
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Adopt an already acquired stream.
    pub fn attach(&mut self, stream: LocalStream) {
        self.stream = Some(stream);
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    /// Start broadcasting state changes on `outbound`.
    pub fn bind(&mut self, outbound: Outbound) {
        self.outbound = Some(outbound);
    }

    pub fn unbind(&mut self) {
        self.outbound = None;
    }

    pub fn set_mic(&mut self, enabled: bool) -> Result<(), MeshError> {
        self.set_enabled(MediaKind::Mic, enabled)
    }

    pub fn set_cam(&mut self, enabled: bool) -> Result<(), MeshError> {
        self.set_enabled(MediaKind::Cam, enabled)
    }

    pub fn toggle_mic(&mut self) -> Result<bool, MeshError> {
        let enabled = !self.is_enabled(MediaKind::Mic)?;
        self.set_mic(enabled)?;
        Ok(enabled)
    }

    pub fn toggle_cam(&mut self) -> Result<bool, MeshError> {
        let enabled = !self.is_enabled(MediaKind::Cam)?;
        self.set_cam(enabled)?;
        Ok(enabled)
    }

    /// Flip the local flag without telling anyone. Used for the join
    /// defaults, before the signaling channel is up. A kind the stream does
    /// not capture is skipped.
    pub fn apply_initial(&mut self, kind: MediaKind, enabled: bool) -> Result<(), MeshError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| MeshError::Media("no local stream".into()))?;
        if let Some(track) = stream.track(kind) {
            track.set_enabled(enabled);
        }
        Ok(())
    }

    /// Announce every disabled track once. Remote peers assume enabled
    /// until told otherwise.
    pub fn announce_disabled(&self) {
        let Some(stream) = &self.stream else {
            return;
        };
        for kind in [MediaKind::Mic, MediaKind::Cam] {
            let enabled = stream.track(kind).is_some_and(|t| t.is_enabled());
            if !enabled {
                self.broadcast(kind, false);
            }
        }
    }

    pub fn set_enabled(&mut self, kind: MediaKind, enabled: bool) -> Result<(), MeshError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| MeshError::Media("no local stream".into()))?;
        let track = stream
            .track(kind)
            .ok_or_else(|| MeshError::Media(format!("no local {kind} track")))?;

        track.set_enabled(enabled);
        tracing::info!("{kind} enabled: {enabled}");
        self.broadcast(kind, enabled);
        self.emitter.emit(MeshEvent::LocalMediaChanged { kind, enabled });
        Ok(())
    }

    pub fn is_enabled(&self, kind: MediaKind) -> Result<bool, MeshError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| MeshError::Media("no local stream".into()))?;
        stream
            .track(kind)
            .map(|t| t.is_enabled())
            .ok_or_else(|| MeshError::Media(format!("no local {kind} track")))
    }

    /// Current mic flag; `false` without a stream or track.
    pub fn mic_enabled(&self) -> bool {
        self.is_enabled(MediaKind::Mic).unwrap_or(false)
    }

    pub fn cam_enabled(&self) -> bool {
        self.is_enabled(MediaKind::Cam).unwrap_or(false)
    }

    /// Stop every local track. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            for track in stream.tracks() {
                track.stop();
            }
            tracing::info!("local media released");
        }
    }

    fn broadcast(&self, kind: MediaKind, enabled: bool) {
        signaling::send(
            self.outbound.as_ref(),
            ClientMessage::MediaStateChange {
                room_id: self.room_id.clone(),
                kind,
                enabled,
            },
        );
    }
}
