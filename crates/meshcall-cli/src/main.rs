use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use meshcall_core::{
    ConnectionState, HttpRoomDirectory, MeshError, MeshEvent, MeshEventListener,
    RoomDirectory, RoomSession, SessionConfig, SessionDeps, SessionHandle, SettingsStore,
};
use meshcall_rtc::{CaptureConfig, WebRtcBackend, WsSignalingConnector};

/// The binary crate is `meshcall`, so its own events are under that target.
const DEFAULT_LOG_FILTER: &str = "meshcall_core=debug,meshcall_rtc=info,meshcall=info";

/// Join a meshcall room from the terminal.
#[derive(Debug, Parser)]
#[command(name = "meshcall", version)]
struct Cli {
    /// Room to join.
    #[arg(long)]
    room: String,

    /// Bearer token issued for the room.
    #[arg(long, env = "MESHCALL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Signaling server, `ws://` or `wss://`. Remembered for later runs.
    #[arg(long)]
    signaling_url: Option<String>,

    /// Base URL of the room metadata service. Remembered for later runs.
    #[arg(long)]
    metadata_url: Option<String>,

    /// Display name overriding the one in the token. Remembered for later runs.
    #[arg(long)]
    name: Option<String>,

    /// Directory holding settings.json.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Join with the microphone muted.
    #[arg(long)]
    muted: bool,

    /// Join with the camera off.
    #[arg(long)]
    camera_off: bool,

    /// Do not capture audio at all.
    #[arg(long)]
    no_audio: bool,

    /// Do not capture video at all.
    #[arg(long)]
    no_video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Mic(bool),
    Cam(bool),
    ToggleMic,
    ToggleCam,
    OpenChat,
    CloseChat,
    Renegotiate,
    Who,
    Invite,
    Leave,
    Chat(String),
    Unknown(String),
    Empty,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Chat(line.to_string());
    };
    let mut words = command.split_whitespace();
    match (words.next(), words.next()) {
        (Some("mic"), Some("on")) => Input::Mic(true),
        (Some("mic"), Some("off")) => Input::Mic(false),
        (Some("mic"), None) => Input::ToggleMic,
        (Some("cam"), Some("on")) => Input::Cam(true),
        (Some("cam"), Some("off")) => Input::Cam(false),
        (Some("cam"), None) => Input::ToggleCam,
        (Some("chat"), Some("open")) => Input::OpenChat,
        (Some("chat"), Some("close")) => Input::CloseChat,
        (Some("renegotiate"), None) => Input::Renegotiate,
        (Some("who"), None) => Input::Who,
        (Some("invite"), None) => Input::Invite,
        (Some("leave") | Some("quit"), None) => Input::Leave,
        _ => Input::Unknown(line.to_string()),
    }
}

/// Prints session events as they happen.
struct Printer;

impl MeshEventListener for Printer {
    fn on_event(&self, event: MeshEvent) {
        match event {
            MeshEvent::ConnectionStateChanged(state) => println!("* connection: {state:?}"),
            MeshEvent::ParticipantJoined(p) => println!("* {} joined", p.display_name),
            MeshEvent::ParticipantLeft(id) => println!("* {id} left"),
            MeshEvent::ParticipantUpdated(entry) => println!(
                "* {}: mic {} cam {}",
                entry.display_name,
                on_off(entry.mic_enabled),
                on_off(entry.cam_enabled)
            ),
            MeshEvent::LinkStateChanged {
                connection_id,
                state,
            } => tracing::debug!("link {connection_id} is {state:?}"),
            MeshEvent::LocalMediaChanged { kind, enabled } => {
                println!("* your {kind} is {}", on_off(enabled))
            }
            MeshEvent::ChatMessageReceived(message) => {
                println!("<{}> {}", message.sender.display_name, message.body)
            }
            MeshEvent::UnreadCountChanged(count) => tracing::debug!("{count} unread messages"),
            MeshEvent::RoomMetadataChanged(metadata) => {
                if let Some(name) = metadata.room_name {
                    println!("* room: {name}");
                }
            }
            MeshEvent::RoomMetadataUnavailable(reason) => {
                tracing::warn!("room name unavailable: {reason}")
            }
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir.clone().unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("meshcall"))
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

fn session_config(cli: &Cli, store: &mut SettingsStore) -> Result<(SessionConfig, SessionDeps), MeshError> {
    if let Some(url) = &cli.signaling_url {
        store.set_signaling_url(Some(url.clone()));
    }
    if let Some(url) = &cli.metadata_url {
        store.set_metadata_url(Some(url.clone()));
    }
    if let Some(name) = &cli.name {
        store.set_display_name_override(Some(name.clone()));
    }
    let settings = store.get();

    let mut config = SessionConfig::from_settings(&cli.room, cli.token.clone(), settings)?;
    if cli.muted {
        config.mic_enabled_on_join = false;
    }
    if cli.camera_off {
        config.camera_enabled_on_join = false;
    }

    let signaling_url = settings
        .signaling_url
        .as_deref()
        .ok_or_else(|| MeshError::Connection("no signaling url configured, pass --signaling-url".into()))?;
    let directory = settings
        .metadata_url
        .as_deref()
        .map(HttpRoomDirectory::new)
        .transpose()?
        .map(|d| Arc::new(d) as Arc<dyn RoomDirectory>);
    let backend = WebRtcBackend::new(CaptureConfig {
        audio: !cli.no_audio,
        video: !cli.no_video,
    })?;

    let deps = SessionDeps {
        connector: Arc::new(WsSignalingConnector::new(signaling_url)?),
        backend: Arc::new(backend),
        directory,
    };
    Ok((config, deps))
}

async fn run_input(handle: &SessionHandle, input: Input) -> Result<(), MeshError> {
    match input {
        Input::Mic(enabled) => handle.set_mic(enabled).await,
        Input::Cam(enabled) => handle.set_cam(enabled).await,
        Input::ToggleMic => handle.toggle_mic().await.map(|_| ()),
        Input::ToggleCam => handle.toggle_cam().await.map(|_| ()),
        Input::OpenChat => {
            handle.open_chat()?;
            for message in handle.snapshot().chat {
                println!("<{}> {}", message.sender.display_name, message.body);
            }
            Ok(())
        }
        Input::CloseChat => handle.close_chat(),
        Input::Renegotiate => handle.renegotiate(),
        Input::Who => {
            let snapshot = handle.snapshot();
            println!("* you are {}", snapshot.local.display_name);
            for entry in snapshot.roster {
                println!(
                    "  {} ({}) mic {} cam {}",
                    entry.display_name,
                    entry.connection_id,
                    on_off(entry.mic_enabled),
                    on_off(entry.cam_enabled)
                );
            }
            if let Some(badge) = snapshot.unread_badge {
                println!("* {badge} unread");
            }
            Ok(())
        }
        Input::Invite => {
            let snapshot = handle.snapshot();
            match snapshot.invite_url {
                Some(url) => println!("* invite: {url}"),
                None => println!("* no invite base url configured"),
            }
            if let Some(password) = snapshot.room_password {
                println!("* password: {password}");
            }
            Ok(())
        }
        Input::Chat(body) => handle.send_chat(body).await,
        Input::Unknown(line) => {
            println!("* unknown command {line}");
            Ok(())
        }
        Input::Leave | Input::Empty => Ok(()),
    }
}

async fn run(cli: Cli) -> Result<(), MeshError> {
    let mut store = SettingsStore::new(data_dir(&cli));
    tracing::debug!("settings at {}", store.path().display());
    let (config, deps) = session_config(&cli, &mut store)?;

    let session = RoomSession::new(config, deps);
    session.add_listener(Arc::new(Printer));
    let handle = session.join().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            reason = handle.closed() => {
                println!("* session ended: {reason:?}");
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let input = match line {
                    Ok(Some(line)) => parse_input(&line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("cannot read stdin: {e}");
                        break;
                    }
                };
                if input == Input::Leave {
                    break;
                }
                if let Err(e) = run_input(&handle, input).await {
                    if matches!(handle.snapshot().connection_state, ConnectionState::Closed { .. }) {
                        tracing::debug!("command after close: {e}");
                    } else {
                        println!("* {e}");
                    }
                }
            }
        }
    }

    let reason = handle.leave().await?;
    tracing::info!("left room: {reason:?}");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
            }),
        )
        .with_ansi(false)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("meshcall: {e}");
            ExitCode::FAILURE
        }
    }
}
