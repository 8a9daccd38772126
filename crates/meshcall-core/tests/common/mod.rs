#![allow(dead_code)]

//! In-memory stand-ins for the signaling server, the media stack and the room
//! directory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use meshcall_core::controls::LocalMediaController;
use meshcall_core::events::{EventEmitter, MeshEvent, MeshEventListener};
use meshcall_core::media::{
    LocalStream, LocalTrack, MediaBackend, MediaCommand, MediaEvent, MediaEventSink, RemoteStream,
};
use meshcall_core::protocol::{
    ClientMessage, ConnectionId, IceCandidate, MediaKind, ParticipantIdentity, ServerMessage,
};
use meshcall_core::room::{CoreParts, SessionCore};
use meshcall_core::settings::default_ice_servers;
use meshcall_core::signaling::{SignalingChannel, SignalingConnector};
use meshcall_core::{Credential, MeshError, RoomDirectory};

pub fn id(s: &str) -> ConnectionId {
    ConnectionId::new(s)
}

/// A JWT-shaped token carrying the given claims.
pub fn token(claims: &str) -> String {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    format!("{header}.{}.c2ln", URL_SAFE_NO_PAD.encode(claims))
}

/// Scripted media stack. Every command completes immediately, in the order a
/// real peer connection would report it.
pub struct FakeBackend {
    owner: String,
    deny: bool,
    commands: Mutex<Vec<MediaCommand>>,
    acquired: Mutex<Option<LocalStream>>,
    acquire_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(owner: &str) -> Arc<Self> {
        Arc::new(Self {
            owner: owner.to_string(),
            deny: false,
            commands: Mutex::new(Vec::new()),
            acquired: Mutex::new(None),
            acquire_calls: AtomicUsize::new(0),
        })
    }

    pub fn denying(owner: &str) -> Arc<Self> {
        Arc::new(Self {
            owner: owner.to_string(),
            deny: true,
            commands: Mutex::new(Vec::new()),
            acquired: Mutex::new(None),
            acquire_calls: AtomicUsize::new(0),
        })
    }

    pub fn stream(&self) -> LocalStream {
        let stream = LocalStream::new(
            format!("{}-stream", self.owner),
            vec![
                LocalTrack::new(format!("{}-mic", self.owner), MediaKind::Mic),
                LocalTrack::new(format!("{}-cam", self.owner), MediaKind::Cam),
            ],
        );
        *self.acquired.lock().unwrap() = Some(stream.clone());
        stream
    }

    pub fn acquired(&self) -> Option<LocalStream> {
        self.acquired.lock().unwrap().clone()
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<MediaCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Peers this backend was asked to create an offer for, in order.
    pub fn offers_created(&self) -> Vec<ConnectionId> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                MediaCommand::CreateOffer { connection_id } => Some(connection_id),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&MediaCommand) -> bool) -> usize {
        self.commands().iter().filter(|c| pred(c)).count()
    }

    fn candidate(&self, peer: &ConnectionId) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{}-{peer} 1 udp 2122260223 10.0.0.1 5000 typ host", self.owner),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn remote_stream(peer: &ConnectionId) -> RemoteStream {
        RemoteStream {
            stream_id: format!("{peer}-stream"),
        }
    }
}

impl MediaBackend for FakeBackend {
    fn acquire(&self) -> BoxFuture<'static, Result<LocalStream, MeshError>> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.deny {
            Err(MeshError::MediaAccessDenied("permission dismissed".into()))
        } else {
            Ok(self.stream())
        };
        Box::pin(async move { result })
    }

    fn execute(&self, command: MediaCommand, events: &MediaEventSink) {
        self.commands.lock().unwrap().push(command.clone());
        let post = |event: MediaEvent| {
            let _ = events.send(event);
        };
        match command {
            MediaCommand::CreateOffer { connection_id } => {
                post(MediaEvent::LocalOffer {
                    connection_id: connection_id.clone(),
                    sdp: format!("offer {}->{connection_id}", self.owner),
                });
                post(MediaEvent::LocalIceCandidate {
                    candidate: self.candidate(&connection_id),
                    connection_id,
                });
            }
            MediaCommand::AcceptOffer { connection_id, .. } => {
                post(MediaEvent::RemoteDescriptionApplied {
                    connection_id: connection_id.clone(),
                });
                post(MediaEvent::LocalAnswer {
                    connection_id: connection_id.clone(),
                    sdp: format!("answer {}->{connection_id}", self.owner),
                });
                post(MediaEvent::LocalIceCandidate {
                    candidate: self.candidate(&connection_id),
                    connection_id: connection_id.clone(),
                });
                post(MediaEvent::TrackReceived {
                    stream: Self::remote_stream(&connection_id),
                    connection_id,
                });
            }
            MediaCommand::AcceptAnswer { connection_id, .. } => {
                post(MediaEvent::RemoteDescriptionApplied {
                    connection_id: connection_id.clone(),
                });
                post(MediaEvent::TrackReceived {
                    stream: Self::remote_stream(&connection_id),
                    connection_id,
                });
            }
            MediaCommand::Open { .. }
            | MediaCommand::AddIceCandidate { .. }
            | MediaCommand::Close { .. } => {}
        }
    }
}

/// Records every event a session emits.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<MeshEvent>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<MeshEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn any(&self, pred: impl Fn(&MeshEvent) -> bool) -> bool {
        self.events().iter().any(pred)
    }
}

impl MeshEventListener for EventLog {
    fn on_event(&self, event: MeshEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Fake signaling server relaying frames between in-process participants.
#[derive(Default)]
pub struct Switchboard {
    clients: BTreeMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>,
    joined: Vec<ParticipantIdentity>,
}

impl Switchboard {
    pub fn connect(&mut self, client: &ConnectionId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.insert(client.clone(), tx);
        rx
    }

    fn deliver(&self, to: &ConnectionId, message: ServerMessage) {
        if let Some(tx) = self.clients.get(to) {
            let _ = tx.send(message);
        }
    }

    fn broadcast(&self, except: Option<&ConnectionId>, message: &ServerMessage) {
        for member in &self.joined {
            if Some(&member.connection_id) != except {
                self.deliver(&member.connection_id, message.clone());
            }
        }
    }

    pub fn route(&mut self, from: &ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Join { display_name, .. } => {
                let participants = self.joined.clone();
                self.deliver(from, ServerMessage::RosterSnapshot { participants });
                let identity = ParticipantIdentity::new(from.clone(), display_name);
                self.broadcast(Some(from), &ServerMessage::ParticipantJoined(identity.clone()));
                self.joined.push(identity);
            }
            ClientMessage::Offer { target_id, sdp } => {
                self.deliver(&target_id, ServerMessage::Offer { from_id: from.clone(), sdp });
            }
            ClientMessage::Answer { target_id, sdp } => {
                self.deliver(&target_id, ServerMessage::Answer { from_id: from.clone(), sdp });
            }
            ClientMessage::IceCandidate {
                target_id,
                candidate,
            } => {
                self.deliver(
                    &target_id,
                    ServerMessage::IceCandidate {
                        from_id: from.clone(),
                        candidate,
                    },
                );
            }
            ClientMessage::MediaStateChange { kind, enabled, .. } => {
                let message = ServerMessage::MediaStateChange {
                    connection_id: from.clone(),
                    kind,
                    enabled,
                };
                self.broadcast(Some(from), &message);
            }
            ClientMessage::ChatMessage(message) => {
                self.broadcast(None, &ServerMessage::ChatMessage(message));
            }
            ClientMessage::SetRoomName { room_name, .. } => {
                self.broadcast(None, &ServerMessage::RoomMetadata { room_name });
            }
            ClientMessage::Leave { .. } => {
                self.joined.retain(|p| &p.connection_id != from);
                self.clients.remove(from);
                self.broadcast(
                    None,
                    &ServerMessage::ParticipantLeft {
                        connection_id: from.clone(),
                    },
                );
            }
        }
    }

    pub fn force_close(&mut self) {
        self.broadcast(None, &ServerMessage::RoomForceClosed);
    }
}

/// One in-process participant driven by hand.
pub struct Peer {
    pub core: SessionCore,
    pub backend: Arc<FakeBackend>,
    pub log: Arc<EventLog>,
    pub media_tx: MediaEventSink,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    media: mpsc::UnboundedReceiver<MediaEvent>,
}

/// Several peers around one switchboard.
pub struct Mesh {
    pub room_id: String,
    pub board: Switchboard,
    pub peers: BTreeMap<ConnectionId, Peer>,
}

impl Mesh {
    pub fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            board: Switchboard::default(),
            peers: BTreeMap::new(),
        }
    }

    /// Connect a participant and queue its join announcement.
    pub fn join(&mut self, who: &str, name: &str) {
        let connection_id = id(who);
        let backend = FakeBackend::new(who);
        let emitter = EventEmitter::new();
        let log = EventLog::new();
        emitter.add_listener(log.clone());

        let mut controls = LocalMediaController::new(self.room_id.clone(), emitter.clone());
        controls.attach(backend.stream());

        let inbound = self.board.connect(&connection_id);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        let _ = out_tx.send(ClientMessage::Join {
            room_id: self.room_id.clone(),
            display_name: name.to_string(),
            role_hint: "MEETING".to_string(),
        });

        let core = SessionCore::new(CoreParts {
            room_id: self.room_id.clone(),
            local: ParticipantIdentity::new(connection_id.clone(), name),
            controls,
            ice_servers: default_ice_servers(),
            outbound: out_tx,
            backend: backend.clone(),
            media_events: media_tx.clone(),
            emitter,
            invite_url: None,
            room_password: None,
        })
        .unwrap();

        self.peers.insert(
            connection_id,
            Peer {
                core,
                backend,
                log,
                media_tx,
                outbound: out_rx,
                inbound,
                media: media_rx,
            },
        );
    }

    pub fn peer(&self, who: &str) -> &Peer {
        &self.peers[&id(who)]
    }

    pub fn peer_mut(&mut self, who: &str) -> &mut Peer {
        self.peers.get_mut(&id(who)).unwrap()
    }

    /// Hand everything `who` sent to the switchboard.
    pub fn route(&mut self, who: &str) -> bool {
        let from = id(who);
        let mut moved = false;
        if let Some(peer) = self.peers.get_mut(&from) {
            while let Ok(message) = peer.outbound.try_recv() {
                self.board.route(&from, message);
                moved = true;
            }
        }
        moved
    }

    /// Let `who` process the frames the switchboard delivered to it.
    pub fn deliver_signals(&mut self, who: &str) -> bool {
        let peer = self.peer_mut(who);
        let mut moved = false;
        while let Ok(message) = peer.inbound.try_recv() {
            peer.core.handle_signal(message);
            moved = true;
        }
        moved
    }

    /// Let `who` process its pending media completions.
    pub fn deliver_media(&mut self, who: &str) -> bool {
        let peer = self.peer_mut(who);
        let mut moved = false;
        while let Ok(event) = peer.media.try_recv() {
            peer.core.handle_media(event);
            moved = true;
        }
        moved
    }

    /// Run until nobody has anything left to process.
    pub fn settle(&mut self) {
        for _ in 0..1000 {
            let names: Vec<String> = self.peers.keys().map(|k| k.as_str().to_string()).collect();
            let mut moved = false;
            for who in &names {
                moved |= self.route(who);
            }
            for who in &names {
                moved |= self.deliver_signals(who);
                moved |= self.deliver_media(who);
            }
            if !moved {
                return;
            }
        }
        panic!("mesh did not settle");
    }
}

/// Signaling connector handing out in-memory channels.
pub struct FakeConnector {
    connection_id: ConnectionId,
    reject: Option<String>,
    connects: AtomicUsize,
    server: Mutex<Option<ServerEnd>>,
}

/// The server side of a [`FakeConnector`] connection.
pub struct ServerEnd {
    pub to_client: mpsc::UnboundedSender<ServerMessage>,
    pub from_client: mpsc::UnboundedReceiver<ClientMessage>,
}

impl FakeConnector {
    pub fn accepting(connection_id: &str) -> Arc<Self> {
        Arc::new(Self {
            connection_id: id(connection_id),
            reject: None,
            connects: AtomicUsize::new(0),
            server: Mutex::new(None),
        })
    }

    pub fn rejecting(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            connection_id: id("unused"),
            reject: Some(reason.to_string()),
            connects: AtomicUsize::new(0),
            server: Mutex::new(None),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn take_server(&self) -> ServerEnd {
        self.server.lock().unwrap().take().expect("not connected")
    }
}

impl SignalingConnector for FakeConnector {
    fn connect(&self, _credential: &Credential) -> BoxFuture<'static, Result<SignalingChannel, MeshError>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.reject {
            let err = MeshError::Rejected(reason.clone());
            return Box::pin(async move { Err(err) });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        *self.server.lock().unwrap() = Some(ServerEnd {
            to_client: in_tx,
            from_client: out_rx,
        });
        let channel = SignalingChannel {
            connection_id: self.connection_id.clone(),
            outbound: out_tx,
            inbound: in_rx,
        };
        Box::pin(async move { Ok(channel) })
    }
}

/// Directory answering every lookup with the same result.
pub struct FakeDirectory {
    result: Result<String, String>,
    bearer: Mutex<Option<String>>,
}

impl FakeDirectory {
    pub fn named(name: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(name.to_string()),
            bearer: Mutex::new(None),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Err(message.to_string()),
            bearer: Mutex::new(None),
        })
    }

    pub fn last_bearer(&self) -> Option<String> {
        self.bearer.lock().unwrap().clone()
    }
}

impl RoomDirectory for FakeDirectory {
    fn room_name(
        &self,
        _room_id: &str,
        credential: &Credential,
    ) -> BoxFuture<'static, Result<String, MeshError>> {
        *self.bearer.lock().unwrap() = Some(credential.bearer());
        let result = self.result.clone().map_err(MeshError::Http);
        Box::pin(async move { result })
    }
}
