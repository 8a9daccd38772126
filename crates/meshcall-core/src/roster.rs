use crate::media::RemoteStream;
use crate::protocol::{ConnectionId, MediaKind};

/// One known remote participant and its media flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub mic_enabled: bool,
    pub cam_enabled: bool,
    pub stream: Option<RemoteStream>,
}

/// Partial update applied by [`Roster::upsert`]. `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct RosterPatch {
    pub display_name: Option<String>,
    pub mic_enabled: Option<bool>,
    pub cam_enabled: Option<bool>,
    pub stream: Option<RemoteStream>,
}

impl RosterPatch {
    pub fn presence(display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            ..Default::default()
        }
    }

    pub fn media(display_name: impl Into<String>, stream: RemoteStream) -> Self {
        Self {
            display_name: Some(display_name.into()),
            stream: Some(stream),
            ..Default::default()
        }
    }
}

/// Live view of the remote participants in a room.
///
/// Updated by the session task only. The local participant is never listed,
/// even if the signaling service echoes its own presence back.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: Vec<RosterEntry>,
    local_id: Option<ConnectionId>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_id(&mut self, id: ConnectionId) {
        self.entries.retain(|e| e.connection_id != id);
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<&ConnectionId> {
        self.local_id.as_ref()
    }

    /// Create or update the entry for `id`. New entries start with mic and
    /// camera enabled. Returns the resulting entry, or `None` for the local id.
    pub fn upsert(&mut self, id: &ConnectionId, patch: RosterPatch) -> Option<&RosterEntry> {
        if self.local_id.as_ref() == Some(id) {
            return None;
        }

        let index = match self.entries.iter().position(|e| &e.connection_id == id) {
            Some(index) => index,
            None => {
                self.entries.push(RosterEntry {
                    connection_id: id.clone(),
                    display_name: String::new(),
                    mic_enabled: true,
                    cam_enabled: true,
                    stream: None,
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        if let Some(name) = patch.display_name {
            entry.display_name = name;
        }
        if let Some(mic) = patch.mic_enabled {
            entry.mic_enabled = mic;
        }
        if let Some(cam) = patch.cam_enabled {
            entry.cam_enabled = cam;
        }
        if let Some(stream) = patch.stream {
            entry.stream = Some(stream);
        }
        Some(&self.entries[index])
    }

    /// Apply a remote media state change to an existing entry.
    ///
    /// Returns `false` when the participant is unknown; the change is dropped
    /// rather than creating a nameless entry.
    pub fn apply_media_state(&mut self, id: &ConnectionId, kind: MediaKind, enabled: bool) -> bool {
        let Some(entry) = self.entry_mut(id) else {
            return false;
        };
        match kind {
            MediaKind::Mic => entry.mic_enabled = enabled,
            MediaKind::Cam => entry.cam_enabled = enabled,
        }
        true
    }

    /// Returns `true` if an entry was removed.
    pub fn remove(&mut self, id: &ConnectionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.connection_id != id);
        self.entries.len() != before
    }

    pub fn entry(&self, id: &ConnectionId) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| &e.connection_id == id)
    }

    fn entry_mut(&mut self, id: &ConnectionId) -> Option<&mut RosterEntry> {
        self.entries.iter_mut().find(|e| &e.connection_id == id)
    }

    /// Remote participants in insertion order.
    pub fn snapshot(&self) -> Vec<RosterEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
