//! Meshcall core coordination logic.
//!
//! Runs one participant's side of a small full-mesh call: roster, one peer
//! link per remote participant, local media toggles, chat and the room
//! lifecycle. Signaling transport and media stack are plugged in through
//! [`signaling::SignalingConnector`] and [`media::MediaBackend`]; this crate
//! has no WebRTC dependency of its own.

pub mod chat;
pub mod controls;
pub mod credential;
pub mod directory;
pub mod errors;
pub mod events;
pub mod media;
pub mod peers;
pub mod protocol;
pub mod room;
pub mod roster;
pub mod settings;
pub mod signaling;

pub use credential::Credential;
pub use directory::{HttpRoomDirectory, RoomDirectory};
pub use errors::MeshError;
pub use events::{
    CloseReason, ConnectionState, EventEmitter, LinkState, MeshEvent, MeshEventListener,
    RoomMetadata,
};
pub use media::{
    Connectivity, LocalStream, LocalTrack, MediaBackend, MediaCommand, MediaEvent,
    MediaEventSink, RemoteStream,
};
pub use peers::{LinkRole, LinkSnapshot};
pub use protocol::{ClientMessage, ConnectionId, MediaKind, ParticipantIdentity, ServerMessage};
pub use room::{RoomSession, SessionDeps, SessionHandle, SessionSnapshot};
pub use roster::RosterEntry;
pub use settings::{IceServer, SessionConfig, Settings, SettingsStore};
pub use signaling::{SignalingChannel, SignalingConnector};
