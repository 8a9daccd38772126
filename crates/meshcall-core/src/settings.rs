use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::MeshError;

const SETTINGS_FILE: &str = "settings.json";

/// Public STUN servers used when nothing else is configured.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// One STUN or TURN server handed to every peer connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

pub fn default_ice_servers() -> Vec<IceServer> {
    DEFAULT_STUN_SERVERS.iter().map(|url| IceServer::stun(*url)).collect()
}

/// Host preferences persisted between runs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name_override: Option<String>,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default = "default_true")]
    pub camera_enabled_on_join: bool,
    #[serde(default)]
    pub signaling_url: Option<String>,
    #[serde(default)]
    pub metadata_url: Option<String>,
    #[serde(default)]
    pub invite_base_url: Option<String>,
    /// Extra servers, usually TURN relays, appended to the STUN defaults.
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name_override: None,
            mic_enabled_on_join: true,
            camera_enabled_on_join: true,
            signaling_url: None,
            metadata_url: None,
            invite_base_url: None,
            ice_servers: Vec::new(),
        }
    }
}

/// Settings backed by `<data_dir>/settings.json`.
///
/// Every setter writes the file. Write failures are logged and otherwise
/// ignored; the in-memory value stays authoritative.
pub struct SettingsStore {
    settings: Settings,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join(SETTINGS_FILE);
        let settings = Self::load(&file_path);
        Self {
            settings,
            file_path,
        }
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn set_display_name_override(&mut self, name: Option<String>) {
        self.settings.display_name_override = name;
        self.save();
    }

    pub fn set_mic_enabled_on_join(&mut self, enabled: bool) {
        self.settings.mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&mut self, enabled: bool) {
        self.settings.camera_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_signaling_url(&mut self, url: Option<String>) {
        self.settings.signaling_url = url;
        self.save();
    }

    pub fn set_metadata_url(&mut self, url: Option<String>) {
        self.settings.metadata_url = url;
        self.save();
    }

    pub fn set_invite_base_url(&mut self, url: Option<String>) {
        self.settings.invite_base_url = url;
        self.save();
    }

    pub fn add_ice_server(&mut self, server: IceServer) {
        if !self.settings.ice_servers.contains(&server) {
            self.settings.ice_servers.push(server);
            self.save();
        }
    }

    fn save(&self) {
        if let Some(parent) = self.file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("cannot create settings dir {}: {e}", parent.display());
                return;
            }
        }
        match serde_json::to_string_pretty(&self.settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("cannot write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("cannot serialize settings: {e}"),
        }
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring corrupt settings file {}: {e}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}

/// Everything [`crate::room::RoomSession::join`] needs for one call.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub room_id: String,
    /// Raw bearer token. Parsed and validated on join.
    pub token: Option<String>,
    /// Overrides the name carried in the token.
    pub display_name: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub mic_enabled_on_join: bool,
    pub camera_enabled_on_join: bool,
    pub invite_base_url: Option<Url>,
}

impl SessionConfig {
    pub fn new(room_id: impl Into<String>, token: Option<String>) -> Self {
        Self {
            room_id: room_id.into(),
            token,
            display_name: None,
            ice_servers: default_ice_servers(),
            mic_enabled_on_join: true,
            camera_enabled_on_join: true,
            invite_base_url: None,
        }
    }

    /// Build a config from persisted settings. The room id must not be blank
    /// and a configured invite base must be a valid URL.
    pub fn from_settings(
        room_id: impl Into<String>,
        token: Option<String>,
        settings: &Settings,
    ) -> Result<Self, MeshError> {
        let room_id = room_id.into();
        if room_id.trim().is_empty() {
            return Err(MeshError::Room("room id is empty".into()));
        }

        let invite_base_url = settings
            .invite_base_url
            .as_deref()
            .map(|raw| Url::parse(raw).map_err(|e| MeshError::InvalidUrl(format!("{raw}: {e}"))))
            .transpose()?;

        let mut ice_servers = default_ice_servers();
        for server in &settings.ice_servers {
            if !ice_servers.contains(server) {
                ice_servers.push(server.clone());
            }
        }

        Ok(Self {
            room_id,
            token,
            display_name: settings.display_name_override.clone(),
            ice_servers,
            mic_enabled_on_join: settings.mic_enabled_on_join,
            camera_enabled_on_join: settings.camera_enabled_on_join,
            invite_base_url,
        })
    }

    /// Waiting-room link other people can open to join this room.
    pub fn invite_url(&self) -> Option<String> {
        let base = self.invite_base_url.as_ref()?;
        let base = base.as_str().trim_end_matches('/');
        Some(format!("{base}/{}", urlencoding::encode(&self.room_id)))
    }
}
