use std::sync::{Arc, RwLock};

use crate::protocol::{ChatMessage, ConnectionId, MediaKind, ParticipantIdentity};
use crate::roster::RosterEntry;

/// Events emitted by the session to host listeners.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    ConnectionStateChanged(ConnectionState),
    ParticipantJoined(ParticipantIdentity),
    ParticipantLeft(ConnectionId),
    /// Media flags or the remote stream of a roster entry changed.
    ParticipantUpdated(RosterEntry),
    LinkStateChanged {
        connection_id: ConnectionId,
        state: LinkState,
    },
    LocalMediaChanged {
        kind: MediaKind,
        enabled: bool,
    },
    ChatMessageReceived(ChatMessage),
    UnreadCountChanged(u32),
    RoomMetadataChanged(RoomMetadata),
    RoomMetadataUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed { reason: CloseReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The local user left.
    Left,
    /// The room was closed by an authority on the signaling side.
    ForceClosed,
    /// The signaling channel dropped. Not retried.
    TransportLost,
}

/// Lifecycle of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMetadata {
    pub room_id: String,
    pub room_name: Option<String>,
}

/// Receives events on whichever task emits them, usually the session task.
pub trait MeshEventListener: Send + Sync {
    fn on_event(&self, event: MeshEvent);
}

/// Dispatches events to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn MeshEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn MeshEventListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn emit(&self, event: MeshEvent) {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
