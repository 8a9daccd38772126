use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::chat::SessionChat;
use crate::controls::LocalMediaController;
use crate::credential::Credential;
use crate::directory::RoomDirectory;
use crate::errors::MeshError;
use crate::events::{
    CloseReason, ConnectionState, EventEmitter, MeshEvent, MeshEventListener, RoomMetadata,
};
use crate::media::{LocalStream, MediaBackend, MediaEvent, MediaEventSink, RemoteStream};
use crate::peers::{LinkAction, LinkRole, LinkSnapshot, PeerLinkManager};
use crate::protocol::{
    ChatMessage, ClientMessage, ConnectionId, MEETING_ROLE_HINT, MediaKind, ParticipantIdentity,
    ServerMessage,
};
use crate::roster::{Roster, RosterEntry, RosterPatch};
use crate::settings::{IceServer, SessionConfig};
use crate::signaling::{self, Inbound, Outbound, SignalingConnector};

/// Read-only copy of the session state, published after every processed event.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub local: ParticipantIdentity,
    pub mic_enabled: bool,
    pub cam_enabled: bool,
    pub roster: Vec<RosterEntry>,
    pub links: Vec<LinkSnapshot>,
    pub chat: Vec<ChatMessage>,
    pub unread: u32,
    pub unread_badge: Option<String>,
    pub metadata: RoomMetadata,
    pub invite_url: Option<String>,
    pub room_password: Option<String>,
}

/// Whether the session keeps running after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Closed(CloseReason),
}

/// Everything a [`SessionCore`] is assembled from once media is acquired and
/// the signaling channel is up.
pub struct CoreParts {
    pub room_id: String,
    pub local: ParticipantIdentity,
    /// Must already hold the local stream.
    pub controls: LocalMediaController,
    pub ice_servers: Vec<IceServer>,
    pub outbound: Outbound,
    pub backend: Arc<dyn MediaBackend>,
    pub media_events: MediaEventSink,
    pub emitter: EventEmitter,
    pub invite_url: Option<String>,
    pub room_password: Option<String>,
}

/// Session state machine. Processes one signaling frame, media completion or
/// user command at a time and performs no waiting of its own.
pub struct SessionCore {
    room_id: String,
    local: ParticipantIdentity,
    state: ConnectionState,
    stream: LocalStream,
    roster: Roster,
    links: PeerLinkManager,
    controls: LocalMediaController,
    chat: SessionChat,
    metadata: RoomMetadata,
    outbound: Option<Outbound>,
    backend: Arc<dyn MediaBackend>,
    media_events: MediaEventSink,
    emitter: EventEmitter,
    invite_url: Option<String>,
    room_password: Option<String>,
}

impl SessionCore {
    pub fn new(parts: CoreParts) -> Result<Self, MeshError> {
        let CoreParts {
            room_id,
            local,
            mut controls,
            ice_servers,
            outbound,
            backend,
            media_events,
            emitter,
            invite_url,
            room_password,
        } = parts;

        let stream = controls
            .stream()
            .cloned()
            .ok_or_else(|| MeshError::Media("local media not acquired".into()))?;

        let mut roster = Roster::new();
        roster.set_local_id(local.connection_id.clone());

        let mut chat = SessionChat::new(room_id.clone(), local.clone(), emitter.clone());
        chat.bind(outbound.clone());
        controls.bind(outbound.clone());

        Ok(Self {
            metadata: RoomMetadata {
                room_id: room_id.clone(),
                room_name: None,
            },
            room_id,
            local,
            state: ConnectionState::Connected,
            stream,
            roster,
            links: PeerLinkManager::new(ice_servers, emitter.clone()),
            controls,
            chat,
            outbound: Some(outbound),
            backend,
            media_events,
            emitter,
            invite_url,
            room_password,
        })
    }

    /// Apply one frame from the signaling server.
    pub fn handle_signal(&mut self, message: ServerMessage) -> Flow {
        if let ConnectionState::Closed { reason } = self.state {
            return Flow::Closed(reason);
        }

        match message {
            ServerMessage::Welcome { connection_id } => {
                tracing::debug!("ignoring repeated welcome for {connection_id}");
            }
            ServerMessage::Rejected { reason } => {
                tracing::warn!("signaling rejected a request mid-session: {reason}");
            }
            ServerMessage::RosterSnapshot { participants } => {
                tracing::info!("roster snapshot with {} participant(s)", participants.len());
                for participant in participants {
                    self.discover(participant, LinkRole::Responder);
                }
            }
            ServerMessage::ParticipantJoined(participant) => {
                self.discover(participant, LinkRole::Initiator);
            }
            ServerMessage::ParticipantLeft { connection_id } => {
                tracing::info!("participant left: {connection_id}");
                let actions = self.links.close(&connection_id);
                self.run(actions);
                self.evict(&connection_id);
            }
            ServerMessage::Offer { from_id, sdp } => {
                let actions = self.links.on_remote_offer(&from_id, sdp);
                self.run(actions);
            }
            ServerMessage::Answer { from_id, sdp } => {
                let actions = self.links.on_remote_answer(&from_id, sdp);
                self.run(actions);
            }
            ServerMessage::IceCandidate { from_id, candidate } => {
                let actions = self.links.on_remote_candidate(&from_id, candidate);
                self.run(actions);
            }
            ServerMessage::MediaStateChange {
                connection_id,
                kind,
                enabled,
            } => {
                if connection_id == self.local.connection_id {
                    return Flow::Continue;
                }
                if self.roster.apply_media_state(&connection_id, kind, enabled) {
                    if let Some(entry) = self.roster.entry(&connection_id) {
                        self.emitter.emit(MeshEvent::ParticipantUpdated(entry.clone()));
                    }
                } else {
                    tracing::debug!("media state for unknown participant {connection_id} dropped");
                }
            }
            ServerMessage::ChatMessage(message) => self.chat.receive(message),
            ServerMessage::RoomMetadata { room_name } => {
                tracing::info!("room name set by server: {room_name}");
                self.set_room_name(room_name);
            }
            ServerMessage::RoomForceClosed => {
                tracing::warn!("room {} was closed by the server", self.room_id);
                self.teardown(CloseReason::ForceClosed);
                return Flow::Closed(CloseReason::ForceClosed);
            }
        }
        Flow::Continue
    }

    /// Apply one completion from the media backend. Completions for links
    /// that are gone are dropped by the link manager.
    pub fn handle_media(&mut self, event: MediaEvent) {
        if matches!(self.state, ConnectionState::Closed { .. }) {
            tracing::debug!("session closed, dropping {event:?}");
            return;
        }

        let actions = match event {
            MediaEvent::LocalOffer { connection_id, sdp } => {
                self.links.on_local_offer(&connection_id, sdp)
            }
            MediaEvent::LocalAnswer { connection_id, sdp } => {
                self.links.on_local_answer(&connection_id, sdp)
            }
            MediaEvent::RemoteDescriptionApplied { connection_id } => {
                self.links.on_remote_description_applied(&connection_id)
            }
            MediaEvent::LocalIceCandidate {
                connection_id,
                candidate,
            } => self.links.on_local_candidate(&connection_id, candidate),
            MediaEvent::TrackReceived {
                connection_id,
                stream,
            } => {
                self.attach_remote_stream(&connection_id, stream);
                Vec::new()
            }
            MediaEvent::Connectivity {
                connection_id,
                state,
            } => self.links.on_connectivity(&connection_id, state),
            MediaEvent::NegotiationNeeded { connection_id } => {
                self.links.renegotiate(&connection_id)
            }
            MediaEvent::LinkError {
                connection_id,
                message,
            } => {
                tracing::warn!("link to {connection_id} failed: {message}");
                self.links.fail(&connection_id)
            }
        };
        self.run(actions);
    }

    /// Result of the room directory lookup started on join.
    pub fn handle_room_info(&mut self, result: Result<String, MeshError>) {
        if matches!(self.state, ConnectionState::Closed { .. }) {
            return;
        }
        match result {
            Ok(room_name) => {
                self.set_room_name(room_name.clone());
                signaling::send(
                    self.outbound.as_ref(),
                    ClientMessage::SetRoomName {
                        room_id: self.room_id.clone(),
                        room_name,
                    },
                );
            }
            Err(e) => {
                tracing::warn!("room info unavailable for {}: {e}", self.room_id);
                self.emitter.emit(MeshEvent::RoomMetadataUnavailable(e.to_string()));
            }
        }
    }

    pub fn set_mic(&mut self, enabled: bool) -> Result<(), MeshError> {
        self.ensure_open()?;
        self.controls.set_mic(enabled)
    }

    pub fn set_cam(&mut self, enabled: bool) -> Result<(), MeshError> {
        self.ensure_open()?;
        self.controls.set_cam(enabled)
    }

    pub fn toggle_mic(&mut self) -> Result<bool, MeshError> {
        self.ensure_open()?;
        self.controls.toggle_mic()
    }

    pub fn toggle_cam(&mut self) -> Result<bool, MeshError> {
        self.ensure_open()?;
        self.controls.toggle_cam()
    }

    pub fn send_chat(&mut self, body: &str) -> Result<(), MeshError> {
        self.ensure_open()?;
        self.chat.send(body)
    }

    pub fn open_chat(&mut self) {
        self.chat.open_panel();
    }

    pub fn close_chat(&mut self) {
        self.chat.close_panel();
    }

    /// Ask every initiator link to renegotiate.
    pub fn renegotiate(&mut self) {
        let actions = self.links.renegotiate_all();
        self.run(actions);
    }

    /// Leave the room.
    pub fn leave(&mut self) -> Flow {
        self.teardown(CloseReason::Left);
        Flow::Closed(CloseReason::Left)
    }

    /// Stop the session. Every step runs regardless of what the others did:
    /// links closed, leave announced, transport dropped, media released.
    pub fn teardown(&mut self, reason: CloseReason) {
        if matches!(self.state, ConnectionState::Closed { .. }) {
            return;
        }
        tracing::info!("tearing down session in {} ({reason:?})", self.room_id);

        let actions = self.links.close_all();
        self.run(actions);

        if reason == CloseReason::Left {
            signaling::send(
                self.outbound.as_ref(),
                ClientMessage::Leave {
                    room_id: self.room_id.clone(),
                },
            );
        }
        self.controls.unbind();
        self.chat.unbind();
        self.outbound = None;

        self.controls.release();
        self.chat.clear();
        self.roster.clear();
        self.set_state(ConnectionState::Closed { reason });
    }

    pub fn announce_disabled_media(&self) {
        self.controls.announce_disabled();
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn local(&self) -> &ParticipantIdentity {
        &self.local
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn links(&self) -> &PeerLinkManager {
        &self.links
    }

    pub fn chat(&self) -> &SessionChat {
        &self.chat
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_state: self.state.clone(),
            local: self.local.clone(),
            mic_enabled: self.controls.mic_enabled(),
            cam_enabled: self.controls.cam_enabled(),
            roster: self.roster.snapshot(),
            links: self.links.snapshot(),
            chat: self.chat.messages().to_vec(),
            unread: self.chat.unread(),
            unread_badge: self.chat.unread_badge(),
            metadata: self.metadata.clone(),
            invite_url: self.invite_url.clone(),
            room_password: self.room_password.clone(),
        }
    }

    fn discover(&mut self, participant: ParticipantIdentity, role: LinkRole) {
        let id = participant.connection_id.clone();
        if id == self.local.connection_id {
            tracing::debug!("ignoring own presence echo");
            return;
        }

        let is_new = self.roster.entry(&id).is_none();
        self.roster
            .upsert(&id, RosterPatch::presence(participant.display_name.clone()));
        if is_new {
            tracing::info!("participant joined: {id} ({})", participant.display_name);
            self.emitter.emit(MeshEvent::ParticipantJoined(participant.clone()));
        }

        let actions = self.links.discover(participant, role, &self.stream);
        self.run(actions);
    }

    fn attach_remote_stream(&mut self, id: &ConnectionId, stream: RemoteStream) {
        let Some(identity) = self.links.identity(id) else {
            tracing::debug!("track for closed link {id} dropped");
            return;
        };
        let name = identity.display_name.clone();
        if let Some(entry) = self.roster.upsert(id, RosterPatch::media(name, stream)) {
            let entry = entry.clone();
            self.emitter.emit(MeshEvent::ParticipantUpdated(entry));
        }
    }

    fn evict(&mut self, id: &ConnectionId) {
        if self.roster.remove(id) {
            self.emitter.emit(MeshEvent::ParticipantLeft(id.clone()));
        }
    }

    fn run(&mut self, actions: Vec<LinkAction>) {
        for action in actions {
            match action {
                LinkAction::Media(command) => self.backend.execute(command, &self.media_events),
                LinkAction::Signal(message) => {
                    signaling::send(self.outbound.as_ref(), message);
                }
                LinkAction::Evict(id) => self.evict(&id),
            }
        }
    }

    fn set_room_name(&mut self, room_name: String) {
        self.metadata.room_name = Some(room_name);
        self.emitter
            .emit(MeshEvent::RoomMetadataChanged(self.metadata.clone()));
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state.clone();
        self.emitter.emit(MeshEvent::ConnectionStateChanged(state));
    }

    fn ensure_open(&self) -> Result<(), MeshError> {
        match self.state {
            ConnectionState::Closed { .. } => Err(MeshError::Room("session closed".into())),
            _ => Ok(()),
        }
    }
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn SignalingConnector>,
    pub backend: Arc<dyn MediaBackend>,
    /// Room name lookup. Without one the room stays unnamed until the
    /// server pushes a name.
    pub directory: Option<Arc<dyn RoomDirectory>>,
}

/// A room about to be joined.
pub struct RoomSession {
    config: SessionConfig,
    deps: SessionDeps,
    emitter: EventEmitter,
}

impl RoomSession {
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Self {
        Self {
            config,
            deps,
            emitter: EventEmitter::new(),
        }
    }

    /// Register a listener before joining to observe the whole lifecycle.
    pub fn add_listener(&self, listener: Arc<dyn MeshEventListener>) {
        self.emitter.add_listener(listener);
    }

    /// Join the room.
    ///
    /// The credential is checked before any media is requested, and media is
    /// acquired before the signaling connection is opened. A failure at any
    /// of these steps aborts the join with nothing left running.
    pub async fn join(self) -> Result<SessionHandle, MeshError> {
        let RoomSession {
            config,
            deps,
            emitter,
        } = self;

        let credential = Credential::parse(config.token.as_deref())?;
        let display_name = config
            .display_name
            .clone()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| credential.display_name().to_string());

        emitter.emit(MeshEvent::ConnectionStateChanged(ConnectionState::Connecting));

        let mut controls = LocalMediaController::new(config.room_id.clone(), emitter.clone());
        if let Err(e) = controls.acquire(deps.backend.as_ref()).await {
            tracing::error!("cannot acquire local media: {e}");
            emitter.emit(MeshEvent::ConnectionStateChanged(ConnectionState::Disconnected));
            return Err(e);
        }
        controls.apply_initial(MediaKind::Mic, config.mic_enabled_on_join)?;
        controls.apply_initial(MediaKind::Cam, config.camera_enabled_on_join)?;

        let channel = match deps.connector.connect(&credential).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!("cannot connect to signaling: {e}");
                controls.release();
                emitter.emit(MeshEvent::ConnectionStateChanged(ConnectionState::Disconnected));
                return Err(e);
            }
        };
        tracing::info!(
            "connected to signaling as {} ({display_name})",
            channel.connection_id
        );

        let join = ClientMessage::Join {
            room_id: config.room_id.clone(),
            display_name: display_name.clone(),
            role_hint: MEETING_ROLE_HINT.to_string(),
        };
        if channel.outbound.send(join).is_err() {
            controls.release();
            emitter.emit(MeshEvent::ConnectionStateChanged(ConnectionState::Disconnected));
            return Err(MeshError::Connection("signaling closed before join".into()));
        }

        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let core = SessionCore::new(CoreParts {
            room_id: config.room_id.clone(),
            local: ParticipantIdentity::new(channel.connection_id.clone(), display_name),
            controls,
            ice_servers: config.ice_servers.clone(),
            outbound: channel.outbound,
            backend: deps.backend.clone(),
            media_events: media_tx,
            emitter: emitter.clone(),
            invite_url: config.invite_url(),
            room_password: credential.room_password().map(str::to_string),
        })?;
        emitter.emit(MeshEvent::ConnectionStateChanged(ConnectionState::Connected));
        core.announce_disabled_media();

        let room_info = deps
            .directory
            .as_ref()
            .map(|directory| directory.room_name(&config.room_id, &credential));

        let (snapshot_tx, snapshot_rx) = watch::channel(core.snapshot());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            core,
            SessionInputs {
                inbound: channel.inbound,
                media: media_rx,
                commands: command_rx,
                room_info,
            },
            snapshot_tx,
        ));

        Ok(SessionHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            emitter,
            task,
        })
    }
}

enum Command {
    SetMedia {
        kind: MediaKind,
        enabled: bool,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    ToggleMedia {
        kind: MediaKind,
        reply: oneshot::Sender<Result<bool, MeshError>>,
    },
    SendChat {
        body: String,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    OpenChat,
    CloseChat,
    Renegotiate,
    Leave,
}

struct SessionInputs {
    inbound: Inbound,
    media: mpsc::UnboundedReceiver<MediaEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    room_info: Option<BoxFuture<'static, Result<String, MeshError>>>,
}

async fn run_session(
    mut core: SessionCore,
    inputs: SessionInputs,
    snapshots: watch::Sender<SessionSnapshot>,
) -> CloseReason {
    let SessionInputs {
        mut inbound,
        mut media,
        mut commands,
        room_info,
    } = inputs;
    let mut room_info_pending = room_info.is_some();
    let mut room_info: BoxFuture<'static, Result<String, MeshError>> = match room_info {
        Some(lookup) => lookup,
        None => Box::pin(futures_util::future::pending()),
    };

    loop {
        let flow = tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => core.handle_signal(message),
                None => {
                    tracing::warn!("signaling connection lost");
                    core.teardown(CloseReason::TransportLost);
                    Flow::Closed(CloseReason::TransportLost)
                }
            },
            Some(event) = media.recv() => {
                core.handle_media(event);
                Flow::Continue
            }
            result = &mut room_info, if room_info_pending => {
                room_info_pending = false;
                core.handle_room_info(result);
                Flow::Continue
            }
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut core, command),
                None => {
                    tracing::info!("session handle dropped, leaving");
                    core.leave()
                }
            },
        };

        snapshots.send_replace(core.snapshot());
        if let Flow::Closed(reason) = flow {
            return reason;
        }
    }
}

fn handle_command(core: &mut SessionCore, command: Command) -> Flow {
    match command {
        Command::SetMedia {
            kind,
            enabled,
            reply,
        } => {
            let result = match kind {
                MediaKind::Mic => core.set_mic(enabled),
                MediaKind::Cam => core.set_cam(enabled),
            };
            let _ = reply.send(result);
        }
        Command::ToggleMedia { kind, reply } => {
            let result = match kind {
                MediaKind::Mic => core.toggle_mic(),
                MediaKind::Cam => core.toggle_cam(),
            };
            let _ = reply.send(result);
        }
        Command::SendChat { body, reply } => {
            let _ = reply.send(core.send_chat(&body));
        }
        Command::OpenChat => core.open_chat(),
        Command::CloseChat => core.close_chat(),
        Command::Renegotiate => core.renegotiate(),
        Command::Leave => return core.leave(),
    }
    Flow::Continue
}

/// Handle to a joined session. Dropping it leaves the room.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    emitter: EventEmitter,
    task: JoinHandle<CloseReason>,
}

impl SessionHandle {
    pub fn add_listener(&self, listener: Arc<dyn MeshEventListener>) {
        self.emitter.add_listener(listener);
    }

    /// Latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub async fn set_mic(&self, enabled: bool) -> Result<(), MeshError> {
        self.request(|reply| Command::SetMedia {
            kind: MediaKind::Mic,
            enabled,
            reply,
        })
        .await?
    }

    pub async fn set_cam(&self, enabled: bool) -> Result<(), MeshError> {
        self.request(|reply| Command::SetMedia {
            kind: MediaKind::Cam,
            enabled,
            reply,
        })
        .await?
    }

    /// Returns the new mic state.
    pub async fn toggle_mic(&self) -> Result<bool, MeshError> {
        self.request(|reply| Command::ToggleMedia {
            kind: MediaKind::Mic,
            reply,
        })
        .await?
    }

    pub async fn toggle_cam(&self) -> Result<bool, MeshError> {
        self.request(|reply| Command::ToggleMedia {
            kind: MediaKind::Cam,
            reply,
        })
        .await?
    }

    pub async fn send_chat(&self, body: impl Into<String>) -> Result<(), MeshError> {
        let body = body.into();
        self.request(|reply| Command::SendChat { body, reply }).await?
    }

    pub fn open_chat(&self) -> Result<(), MeshError> {
        self.post(Command::OpenChat)
    }

    pub fn close_chat(&self) -> Result<(), MeshError> {
        self.post(Command::CloseChat)
    }

    pub fn renegotiate(&self) -> Result<(), MeshError> {
        self.post(Command::Renegotiate)
    }

    /// Wait until the session ends on its own, e.g. when the room is closed
    /// by the server or the connection drops.
    pub async fn closed(&self) -> CloseReason {
        let mut snapshots = self.snapshots.clone();
        let result = snapshots
            .wait_for(|s| matches!(s.connection_state, ConnectionState::Closed { .. }))
            .await;
        match result {
            Ok(snapshot) => match snapshot.connection_state {
                ConnectionState::Closed { reason } => reason,
                _ => CloseReason::TransportLost,
            },
            Err(_) => CloseReason::TransportLost,
        }
    }

    /// Leave the room and wait for teardown to finish. Returns why the
    /// session ended, which is not `Left` if it had already ended.
    pub async fn leave(self) -> Result<CloseReason, MeshError> {
        let _ = self.commands.send(Command::Leave);
        self.task
            .await
            .map_err(|e| MeshError::Room(format!("session task failed: {e}")))
    }

    fn post(&self, command: Command) -> Result<(), MeshError> {
        self.commands
            .send(command)
            .map_err(|_| MeshError::Room("session closed".into()))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MeshError> {
        let (reply, response) = oneshot::channel();
        self.post(command(reply))?;
        response
            .await
            .map_err(|_| MeshError::Room("session closed".into()))
    }
}
