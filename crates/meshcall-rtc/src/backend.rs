//! Media backend on top of `webrtc`.
//!
//! Every link gets its own worker task owning one `RTCPeerConnection`.
//! Commands for a link are queued to its worker and applied strictly in
//! order; results and callbacks are posted back on the session's media sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use meshcall_core::media::{
    Connectivity, LocalStream, LocalTrack, MediaBackend, MediaCommand, MediaEvent, MediaEventSink,
    RemoteStream,
};
use meshcall_core::protocol::{ConnectionId, IceCandidate, MediaKind};
use meshcall_core::settings::IceServer;
use meshcall_core::MeshError;

/// Which local devices the host is allowed to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub audio: bool,
    pub video: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

type RemoteTracks = Arc<Mutex<HashMap<ConnectionId, Vec<Arc<TrackRemote>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Local tracks created on acquisition, keyed by track id.
struct LocalMedia {
    stream: LocalStream,
    senders: HashMap<String, Arc<TrackLocalStaticSample>>,
}

/// Feeds encoded frames of one local track to every link it is attached to.
#[derive(Clone)]
pub struct SampleWriter {
    track: LocalTrack,
    output: Arc<TrackLocalStaticSample>,
}

impl SampleWriter {
    pub fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    /// Write one encoded frame. Frames are dropped while the track is
    /// disabled or after it was stopped; returns whether it was sent.
    pub async fn write(&self, data: Bytes, duration: Duration) -> Result<bool, MeshError> {
        if self.track.is_ended() || !self.track.is_enabled() {
            return Ok(false);
        }
        self.output
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| MeshError::Backend(format!("write sample: {e}")))?;
        Ok(true)
    }
}

/// [`MediaBackend`] running one WebRTC peer connection per link.
pub struct WebRtcBackend {
    api: Arc<API>,
    capture: CaptureConfig,
    local: Mutex<Option<LocalMedia>>,
    links: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<MediaCommand>>>,
    remote_tracks: RemoteTracks,
}

impl WebRtcBackend {
    pub fn new(capture: CaptureConfig) -> Result<Self, MeshError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MeshError::Backend(format!("register codecs: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MeshError::Backend(format!("register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            capture,
            local: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            remote_tracks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn capture(&self) -> CaptureConfig {
        self.capture
    }

    /// Writer for the local track of `kind`, once media is acquired.
    pub fn sample_writer(&self, kind: MediaKind) -> Option<SampleWriter> {
        let local = lock(&self.local);
        let local = local.as_ref()?;
        let track = local.stream.track(kind)?.clone();
        let output = local.senders.get(track.id())?.clone();
        Some(SampleWriter { track, output })
    }

    /// Tracks received so far from `connection_id`.
    pub fn remote_tracks(&self, connection_id: &ConnectionId) -> Vec<Arc<TrackRemote>> {
        lock(&self.remote_tracks)
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of links with a running worker.
    pub fn active_links(&self) -> usize {
        lock(&self.links).len()
    }

    fn create_local_media(&self) -> Result<LocalStream, MeshError> {
        let mut local = lock(&self.local);
        if let Some(existing) = local.as_ref() {
            // a released stream is recaptured on the next acquisition
            if !existing.stream.tracks().iter().all(LocalTrack::is_ended) {
                return Ok(existing.stream.clone());
            }
        }
        if !self.capture.audio && !self.capture.video {
            return Err(MeshError::MediaAccessDenied(
                "capture of both audio and video is disabled".into(),
            ));
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        let mut senders = HashMap::new();
        for (kind, allowed, mime_type) in [
            (MediaKind::Mic, self.capture.audio, MIME_TYPE_OPUS),
            (MediaKind::Cam, self.capture.video, MIME_TYPE_VP8),
        ] {
            if !allowed {
                continue;
            }
            let track_id = format!("{kind}-{}", uuid::Uuid::new_v4());
            let output = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track_id.clone(),
                stream_id.clone(),
            ));
            senders.insert(track_id.clone(), output);
            tracks.push(LocalTrack::new(track_id, kind));
        }

        let stream = LocalStream::new(stream_id, tracks);
        *local = Some(LocalMedia {
            stream: stream.clone(),
            senders,
        });
        Ok(stream)
    }

    fn open(
        &self,
        connection_id: ConnectionId,
        ice_servers: Vec<IceServer>,
        stream: LocalStream,
        events: &MediaEventSink,
    ) {
        let mut links = lock(&self.links);
        if links.contains_key(&connection_id) {
            tracing::warn!("peer connection for {connection_id} already open");
            return;
        }

        let senders: Vec<Arc<TrackLocalStaticSample>> = {
            let local = lock(&self.local);
            match local.as_ref() {
                Some(local) => stream
                    .tracks()
                    .iter()
                    .filter_map(|t| local.senders.get(t.id()).cloned())
                    .collect(),
                None => Vec::new(),
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        links.insert(connection_id.clone(), tx);

        let worker = LinkWorker {
            connection_id,
            api: self.api.clone(),
            ice_servers,
            senders,
            events: events.clone(),
            remote_tracks: self.remote_tracks.clone(),
        };
        tokio::spawn(worker.run(rx));
    }
}

impl MediaBackend for WebRtcBackend {
    fn acquire(&self) -> BoxFuture<'static, Result<LocalStream, MeshError>> {
        let result = self.create_local_media();
        Box::pin(async move { result })
    }

    fn execute(&self, command: MediaCommand, events: &MediaEventSink) {
        match command {
            MediaCommand::Open {
                connection_id,
                ice_servers,
                stream,
            } => self.open(connection_id, ice_servers, stream, events),
            MediaCommand::Close { connection_id } => {
                let worker = lock(&self.links).remove(&connection_id);
                if let Some(worker) = worker {
                    let _ = worker.send(MediaCommand::Close { connection_id });
                }
            }
            command => {
                let links = lock(&self.links);
                match links.get(command.connection_id()) {
                    Some(worker) => {
                        if worker.send(command).is_err() {
                            tracing::debug!("peer connection worker already gone");
                        }
                    }
                    None => tracing::debug!(
                        "no peer connection for {}, dropping command",
                        command.connection_id()
                    ),
                }
            }
        }
    }
}

struct LinkWorker {
    connection_id: ConnectionId,
    api: Arc<API>,
    ice_servers: Vec<IceServer>,
    senders: Vec<Arc<TrackLocalStaticSample>>,
    events: MediaEventSink,
    remote_tracks: RemoteTracks,
}

impl LinkWorker {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<MediaCommand>) {
        let id = self.connection_id.clone();
        let pc = match self.connect().await {
            Ok(pc) => pc,
            Err(e) => {
                self.post(MediaEvent::LinkError {
                    connection_id: id,
                    message: e.to_string(),
                });
                return;
            }
        };
        tracing::debug!("peer connection for {id} ready");

        while let Some(command) = commands.recv().await {
            if let MediaCommand::Close { .. } = command {
                break;
            }
            if let Err(e) = self.apply(&pc, command).await {
                tracing::warn!("peer connection {id}: {e}");
                self.post(MediaEvent::LinkError {
                    connection_id: id.clone(),
                    message: e.to_string(),
                });
            }
        }

        if let Err(e) = pc.close().await {
            tracing::warn!("error closing peer connection {id}: {e}");
        }
        lock(&self.remote_tracks).remove(&id);
        tracing::debug!("peer connection for {id} closed");
    }

    async fn connect(&self) -> Result<Arc<RTCPeerConnection>, MeshError> {
        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| MeshError::Backend(format!("create peer connection: {e}")))?,
        );

        for sender in &self.senders {
            pc.add_track(sender.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| MeshError::Backend(format!("add track: {e}")))?;
        }

        self.install_callbacks(&pc);
        Ok(pc)
    }

    fn install_callbacks(&self, pc: &RTCPeerConnection) {
        let events = self.events.clone();
        let id = self.connection_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let id = id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(MediaEvent::LocalIceCandidate {
                            connection_id: id,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            },
                        });
                    }
                    Err(e) => tracing::warn!("cannot serialize candidate for {id}: {e}"),
                }
            })
        }));

        let events = self.events.clone();
        let id = self.connection_id.clone();
        let registry = self.remote_tracks.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let stream_id = track.stream_id();
            tracing::info!("remote {} track from {id} in stream {stream_id}", track.kind());
            lock(&registry).entry(id.clone()).or_default().push(track);
            let _ = events.send(MediaEvent::TrackReceived {
                connection_id: id.clone(),
                stream: RemoteStream { stream_id },
            });
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let id = self.connection_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!("peer connection {id} state {state}");
            let _ = events.send(MediaEvent::Connectivity {
                connection_id: id.clone(),
                state: connectivity(state),
            });
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let id = self.connection_id.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let _ = events.send(MediaEvent::NegotiationNeeded {
                connection_id: id.clone(),
            });
            Box::pin(async {})
        }));
    }

    async fn apply(&self, pc: &RTCPeerConnection, command: MediaCommand) -> Result<(), MeshError> {
        let id = self.connection_id.clone();
        match command {
            MediaCommand::CreateOffer { .. } => {
                let offer = pc.create_offer(None).await.map_err(backend("create offer"))?;
                pc.set_local_description(offer.clone())
                    .await
                    .map_err(backend("set local offer"))?;
                self.post(MediaEvent::LocalOffer {
                    connection_id: id,
                    sdp: offer.sdp,
                });
            }
            MediaCommand::AcceptOffer { sdp, .. } => {
                let offer = RTCSessionDescription::offer(sdp).map_err(backend("parse offer"))?;
                pc.set_remote_description(offer)
                    .await
                    .map_err(backend("set remote offer"))?;
                self.post(MediaEvent::RemoteDescriptionApplied {
                    connection_id: id.clone(),
                });
                let answer = pc.create_answer(None).await.map_err(backend("create answer"))?;
                pc.set_local_description(answer.clone())
                    .await
                    .map_err(backend("set local answer"))?;
                self.post(MediaEvent::LocalAnswer {
                    connection_id: id,
                    sdp: answer.sdp,
                });
            }
            MediaCommand::AcceptAnswer { sdp, .. } => {
                let answer = RTCSessionDescription::answer(sdp).map_err(backend("parse answer"))?;
                pc.set_remote_description(answer)
                    .await
                    .map_err(backend("set remote answer"))?;
                self.post(MediaEvent::RemoteDescriptionApplied { connection_id: id });
            }
            // a stale or malformed candidate never takes the link down
            MediaCommand::AddIceCandidate { candidate, .. } => {
                if let Err(e) = pc
                    .add_ice_candidate(RTCIceCandidateInit {
                        candidate: candidate.candidate,
                        sdp_mid: candidate.sdp_mid,
                        sdp_mline_index: candidate.sdp_mline_index,
                        username_fragment: None,
                    })
                    .await
                {
                    tracing::warn!("dropping remote candidate for {id}: {e}");
                }
            }
            MediaCommand::Open { .. } | MediaCommand::Close { .. } => {
                tracing::debug!("ignoring lifecycle command inside worker for {id}");
            }
        }
        Ok(())
    }

    fn post(&self, event: MediaEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("session gone, dropping media event for {}", self.connection_id);
        }
    }
}

fn backend(context: &'static str) -> impl Fn(webrtc::Error) -> MeshError {
    move |e| MeshError::Backend(format!("{context}: {e}"))
}

fn connectivity(state: RTCPeerConnectionState) -> Connectivity {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Connectivity::New,
        RTCPeerConnectionState::Connecting => Connectivity::Connecting,
        RTCPeerConnectionState::Connected => Connectivity::Connected,
        RTCPeerConnectionState::Disconnected => Connectivity::Disconnected,
        RTCPeerConnectionState::Failed => Connectivity::Failed,
        RTCPeerConnectionState::Closed => Connectivity::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_states_map_to_connectivity() {
        assert_eq!(connectivity(RTCPeerConnectionState::Failed), Connectivity::Failed);
        assert_eq!(
            connectivity(RTCPeerConnectionState::Disconnected),
            Connectivity::Disconnected
        );
        assert_eq!(connectivity(RTCPeerConnectionState::Unspecified), Connectivity::New);
    }

    #[tokio::test]
    async fn acquire_honours_capture_config() {
        let backend = WebRtcBackend::new(CaptureConfig {
            audio: true,
            video: false,
        })
        .unwrap();
        let stream = backend.acquire().await.unwrap();
        assert_eq!(stream.tracks().len(), 1);
        assert!(stream.track(MediaKind::Mic).is_some());
        assert!(backend.sample_writer(MediaKind::Cam).is_none());

        let again = backend.acquire().await.unwrap();
        assert_eq!(again.id(), stream.id());
    }

    #[tokio::test]
    async fn nothing_to_capture_is_denied() {
        let backend = WebRtcBackend::new(CaptureConfig {
            audio: false,
            video: false,
        })
        .unwrap();
        assert!(matches!(
            backend.acquire().await,
            Err(MeshError::MediaAccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn commands_for_unknown_links_are_dropped() {
        let backend = WebRtcBackend::new(CaptureConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        backend.execute(
            MediaCommand::CreateOffer {
                connection_id: ConnectionId::new("ghost"),
            },
            &tx,
        );
        backend.execute(
            MediaCommand::Close {
                connection_id: ConnectionId::new("ghost"),
            },
            &tx,
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.active_links(), 0);
    }

    #[tokio::test]
    async fn two_backends_negotiate_a_link() {
        let a = WebRtcBackend::new(CaptureConfig::default()).unwrap();
        let b = WebRtcBackend::new(CaptureConfig::default()).unwrap();
        let stream_a = a.acquire().await.unwrap();
        let stream_b = b.acquire().await.unwrap();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let to_b = ConnectionId::new("b");
        let to_a = ConnectionId::new("a");

        a.execute(
            MediaCommand::Open {
                connection_id: to_b.clone(),
                ice_servers: Vec::new(),
                stream: stream_a,
            },
            &a_tx,
        );
        b.execute(
            MediaCommand::Open {
                connection_id: to_a.clone(),
                ice_servers: Vec::new(),
                stream: stream_b,
            },
            &b_tx,
        );
        a.execute(MediaCommand::CreateOffer { connection_id: to_b.clone() }, &a_tx);

        let offer = loop {
            match a_rx.recv().await.unwrap() {
                MediaEvent::LocalOffer { sdp, .. } => break sdp,
                _ => continue,
            }
        };
        assert!(offer.starts_with("v=0"));

        b.execute(
            MediaCommand::AcceptOffer {
                connection_id: to_a.clone(),
                sdp: offer,
            },
            &b_tx,
        );
        let mut applied = false;
        let answer = loop {
            match b_rx.recv().await.unwrap() {
                MediaEvent::RemoteDescriptionApplied { .. } => applied = true,
                MediaEvent::LocalAnswer { sdp, .. } => break sdp,
                MediaEvent::LinkError { message, .. } => panic!("{message}"),
                _ => continue,
            }
        };
        assert!(applied);
        assert!(answer.starts_with("v=0"));

        a.execute(MediaCommand::Close { connection_id: to_b }, &a_tx);
        b.execute(MediaCommand::Close { connection_id: to_a }, &b_tx);
        assert_eq!(a.active_links(), 0);
        assert_eq!(b.active_links(), 0);
    }

    #[tokio::test]
    async fn bad_remote_candidate_keeps_the_link() {
        let a = WebRtcBackend::new(CaptureConfig::default()).unwrap();
        let b = WebRtcBackend::new(CaptureConfig::default()).unwrap();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let to_b = ConnectionId::new("b");
        let to_a = ConnectionId::new("a");

        a.execute(
            MediaCommand::Open {
                connection_id: to_b.clone(),
                ice_servers: Vec::new(),
                stream: a.acquire().await.unwrap(),
            },
            &a_tx,
        );
        b.execute(
            MediaCommand::Open {
                connection_id: to_a.clone(),
                ice_servers: Vec::new(),
                stream: b.acquire().await.unwrap(),
            },
            &b_tx,
        );
        a.execute(MediaCommand::CreateOffer { connection_id: to_b.clone() }, &a_tx);
        let offer = loop {
            if let MediaEvent::LocalOffer { sdp, .. } = a_rx.recv().await.unwrap() {
                break sdp;
            }
        };
        b.execute(
            MediaCommand::AcceptOffer {
                connection_id: to_a.clone(),
                sdp: offer,
            },
            &b_tx,
        );
        b.execute(
            MediaCommand::AddIceCandidate {
                connection_id: to_a.clone(),
                candidate: IceCandidate::new("candidate:stale garbage"),
            },
            &b_tx,
        );
        // commands run in order, so this offer completes after the candidate
        b.execute(MediaCommand::CreateOffer { connection_id: to_a.clone() }, &b_tx);

        let mut answered = false;
        loop {
            match b_rx.recv().await.unwrap() {
                MediaEvent::LocalAnswer { .. } => answered = true,
                MediaEvent::LocalOffer { .. } => break,
                MediaEvent::LinkError { message, .. } => panic!("link failed: {message}"),
                _ => continue,
            }
        }
        assert!(answered);
        assert_eq!(b.active_links(), 1);

        a.execute(MediaCommand::Close { connection_id: to_b }, &a_tx);
        b.execute(MediaCommand::Close { connection_id: to_a }, &b_tx);
    }
}
