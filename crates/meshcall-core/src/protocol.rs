//! Signaling wire format.
//!
//! Every frame is one JSON object tagged by an `"event"` field. Messages the
//! client sends address a peer with `target_id`; the server rewrites them to
//! `from_id` when relaying.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role hint announced on join. The signaling server uses it to tell meeting
/// participants apart from monitoring clients.
pub const MEETING_ROLE_HINT: &str = "MEETING";

/// Transport-assigned identifier of one signaling connection.
///
/// Unique per connection, not per person: a participant that rejoins gets a
/// new id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantIdentity {
    pub connection_id: ConnectionId,
    pub display_name: String,
}

impl ParticipantIdentity {
    pub fn new(connection_id: impl Into<ConnectionId>, display_name: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Which local track a media state change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Mic,
    Cam,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Mic => f.write_str("mic"),
            MediaKind::Cam => f.write_str("cam"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub room_id: String,
    pub sender: ParticipantIdentity,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Frames sent by this client to the signaling service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        room_id: String,
        display_name: String,
        role_hint: String,
    },
    Offer {
        target_id: ConnectionId,
        sdp: String,
    },
    Answer {
        target_id: ConnectionId,
        sdp: String,
    },
    IceCandidate {
        target_id: ConnectionId,
        candidate: IceCandidate,
    },
    MediaStateChange {
        room_id: String,
        kind: MediaKind,
        enabled: bool,
    },
    ChatMessage(ChatMessage),
    SetRoomName {
        room_id: String,
        room_name: String,
    },
    Leave {
        room_id: String,
    },
}

impl ClientMessage {
    /// Peer a negotiation message is addressed to, if any.
    pub fn target(&self) -> Option<&ConnectionId> {
        match self {
            ClientMessage::Offer { target_id, .. }
            | ClientMessage::Answer { target_id, .. }
            | ClientMessage::IceCandidate { target_id, .. } => Some(target_id),
            _ => None,
        }
    }
}

/// Frames received from the signaling service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        connection_id: ConnectionId,
    },
    Rejected {
        reason: String,
    },
    RosterSnapshot {
        participants: Vec<ParticipantIdentity>,
    },
    ParticipantJoined(ParticipantIdentity),
    ParticipantLeft {
        connection_id: ConnectionId,
    },
    Offer {
        from_id: ConnectionId,
        sdp: String,
    },
    Answer {
        from_id: ConnectionId,
        sdp: String,
    },
    IceCandidate {
        from_id: ConnectionId,
        candidate: IceCandidate,
    },
    MediaStateChange {
        connection_id: ConnectionId,
        kind: MediaKind,
        enabled: bool,
    },
    ChatMessage(ChatMessage),
    RoomMetadata {
        room_name: String,
    },
    RoomForceClosed,
}
