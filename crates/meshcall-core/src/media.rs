//! Seam between the coordinator and a concrete media stack.
//!
//! The coordinator never touches a peer connection directly. It issues
//! [`MediaCommand`]s to a [`MediaBackend`] and learns about their outcome
//! through [`MediaEvent`]s posted back into the session queue. Completions may
//! arrive after the link they belong to was closed; the session drops those.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::errors::MeshError;
use crate::protocol::{ConnectionId, IceCandidate, MediaKind};
use crate::settings::IceServer;

/// Channel a backend reports completions on.
pub type MediaEventSink = mpsc::UnboundedSender<MediaEvent>;

/// One local capture track.
///
/// Clones share the same flags, so every link sees the same enabled state.
/// Only the local media controller flips `enabled`; backends read it.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

/// The local capture stream attached to every link.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }
}

/// Reference to media received from a remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
}

/// Connectivity reported by the backend for one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum MediaCommand {
    /// Create the connection and attach the local tracks.
    Open {
        connection_id: ConnectionId,
        ice_servers: Vec<IceServer>,
        stream: LocalStream,
    },
    /// Create an offer and set it as local description.
    CreateOffer { connection_id: ConnectionId },
    /// Apply a remote offer, then create and set the answer.
    AcceptOffer {
        connection_id: ConnectionId,
        sdp: String,
    },
    AcceptAnswer {
        connection_id: ConnectionId,
        sdp: String,
    },
    AddIceCandidate {
        connection_id: ConnectionId,
        candidate: IceCandidate,
    },
    Close { connection_id: ConnectionId },
}

impl MediaCommand {
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            MediaCommand::Open { connection_id, .. }
            | MediaCommand::CreateOffer { connection_id }
            | MediaCommand::AcceptOffer { connection_id, .. }
            | MediaCommand::AcceptAnswer { connection_id, .. }
            | MediaCommand::AddIceCandidate { connection_id, .. }
            | MediaCommand::Close { connection_id } => connection_id,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MediaEvent {
    LocalOffer {
        connection_id: ConnectionId,
        sdp: String,
    },
    LocalAnswer {
        connection_id: ConnectionId,
        sdp: String,
    },
    /// The remote description of the last accepted offer or answer is set.
    RemoteDescriptionApplied { connection_id: ConnectionId },
    LocalIceCandidate {
        connection_id: ConnectionId,
        candidate: IceCandidate,
    },
    TrackReceived {
        connection_id: ConnectionId,
        stream: RemoteStream,
    },
    Connectivity {
        connection_id: ConnectionId,
        state: Connectivity,
    },
    NegotiationNeeded { connection_id: ConnectionId },
    LinkError {
        connection_id: ConnectionId,
        message: String,
    },
}

impl MediaEvent {
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            MediaEvent::LocalOffer { connection_id, .. }
            | MediaEvent::LocalAnswer { connection_id, .. }
            | MediaEvent::RemoteDescriptionApplied { connection_id }
            | MediaEvent::LocalIceCandidate { connection_id, .. }
            | MediaEvent::TrackReceived { connection_id, .. }
            | MediaEvent::Connectivity { connection_id, .. }
            | MediaEvent::NegotiationNeeded { connection_id }
            | MediaEvent::LinkError { connection_id, .. } => connection_id,
        }
    }
}

/// A media stack able to capture local media and run peer connections.
///
/// `execute` must not block: work is started and its outcome reported later
/// on `events`. Commands for the same connection must be applied in the order
/// they were issued.
pub trait MediaBackend: Send + Sync {
    /// Acquire the local capture stream. Fails with
    /// [`MeshError::MediaAccessDenied`] when capture is not permitted.
    fn acquire(&self) -> BoxFuture<'static, Result<LocalStream, MeshError>>;

    fn execute(&self, command: MediaCommand, events: &MediaEventSink);
}
