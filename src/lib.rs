pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod models;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod state;
pub mod transport;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{IceServerConfig, SessionConfig};
use crate::error::Result;
use crate::events::{ChannelObserver, SessionEvent};
use crate::media::synthetic::{NoDevices, SyntheticDevices};
use crate::media::MediaDevices;
use crate::session::{SessionCoordinator, SessionDeps};
use crate::signaling::UserId;
use crate::state::RelayContext;

pub use crate::error::Error;

/// Install the fmt subscriber. `RUST_LOG` wins; the default level is `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run the development signaling relay (blocks until shutdown).
pub async fn run_relay(host: &str, port: u16) -> std::io::Result<()> {
    info!("Starting signaling relay");
    api::server::start_relay(RelayContext::new(), host, port).await
}

/// Options for a headless participant.
#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub url: String,
    pub session_id: String,
    pub user_id: UserId,
    pub token: String,
    pub no_media: bool,
    pub stun: Vec<String>,
}

/// One console command of a headless participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Audio(bool),
    Video(bool),
    Share,
    Unshare,
    Hand(bool),
    Quit,
    Chat(String),
}

impl ConsoleCommand {
    /// Anything that is not a known slash command is chat. Blank lines are ignored.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let mut words = line.split_whitespace();
        let cmd = match (words.next(), words.next()) {
            (Some("/audio"), Some("on")) => ConsoleCommand::Audio(true),
            (Some("/audio"), Some("off")) => ConsoleCommand::Audio(false),
            (Some("/video"), Some("on")) => ConsoleCommand::Video(true),
            (Some("/video"), Some("off")) => ConsoleCommand::Video(false),
            (Some("/share"), None) => ConsoleCommand::Share,
            (Some("/unshare"), None) => ConsoleCommand::Unshare,
            (Some("/hand"), Some("up")) => ConsoleCommand::Hand(true),
            (Some("/hand"), Some("down")) => ConsoleCommand::Hand(false),
            (Some("/quit"), None) => ConsoleCommand::Quit,
            _ => ConsoleCommand::Chat(line.to_string()),
        };
        Some(cmd)
    }
}

fn render(event: &SessionEvent) -> String {
    match event {
        SessionEvent::UserJoined { user_id, user_name } => format!("* {} ({}) joined", user_name, user_id),
        SessionEvent::UserLeft { user_id } => format!("* {} left", user_id),
        SessionEvent::StreamReceived { user_id, stream } => format!(
            "* receiving {} track(s) from {}",
            stream.tracks.len(),
            user_id
        ),
        SessionEvent::ScreenShareReceived {
            user_id,
            screen_sharing,
        } => format!(
            "* {} {} sharing their screen",
            user_id,
            if *screen_sharing { "started" } else { "stopped" }
        ),
        SessionEvent::ChatMessage {
            user_name, message, ..
        } => format!("<{}> {}", user_name, message),
        SessionEvent::ParticipantStateUpdate {
            user_id,
            audio_enabled,
            video_enabled,
        } => format!("* {} audio={} video={}", user_id, audio_enabled, video_enabled),
        SessionEvent::HandRaiseUpdate {
            user_id,
            hand_raised,
        } => format!(
            "* {} {} their hand",
            user_id,
            if *hand_raised { "raised" } else { "lowered" }
        ),
        SessionEvent::Notice(notice) => format!("! {}", notice.message()),
        SessionEvent::Closed { reason } => format!("* session closed: {}", reason),
    }
}

async fn apply(coordinator: &SessionCoordinator, cmd: ConsoleCommand) -> Result<()> {
    match cmd {
        ConsoleCommand::Audio(on) => coordinator.toggle_audio(on).await.map(|_| ()),
        ConsoleCommand::Video(on) => coordinator.toggle_video(on).await.map(|_| ()),
        ConsoleCommand::Share => coordinator.start_screen_sharing().await,
        ConsoleCommand::Unshare => coordinator.stop_screen_sharing().await,
        ConsoleCommand::Hand(up) => coordinator.send_hand_raise_update(up).await,
        ConsoleCommand::Chat(text) => coordinator.send_chat_message(&text).await,
        ConsoleCommand::Quit => Ok(()),
    }
}

/// Join a session as a headless participant driven by stdin.
pub async fn run_join(opts: JoinOptions) -> Result<()> {
    let mut config = SessionConfig::default().with_signaling_url(opts.url.clone());
    if !opts.stun.is_empty() {
        config.ice_servers = opts.stun.iter().map(IceServerConfig::stun).collect();
    }
    let media: Arc<dyn MediaDevices> = if opts.no_media {
        Arc::new(NoDevices)
    } else {
        Arc::new(SyntheticDevices::new())
    };

    let coordinator = SessionCoordinator::new(config.clone(), SessionDeps::from_config(&config, media));
    let (observer, mut events) = ChannelObserver::new();
    coordinator.set_callbacks(observer);
    coordinator
        .initialize(&opts.session_id, opts.user_id, &opts.token)
        .await?;
    info!(
        "Joined session {} as user {} (audio={}, video={})",
        opts.session_id,
        opts.user_id,
        coordinator.is_audio_enabled(),
        coordinator.is_video_enabled()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                let Some(cmd) = ConsoleCommand::parse(&line) else { continue };
                if cmd == ConsoleCommand::Quit {
                    break;
                }
                if let Err(e) = apply(&coordinator, cmd).await {
                    println!("! {}", e);
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", render(&event));
                if matches!(event, SessionEvent::Closed { .. }) {
                    return Ok(());
                }
            }
        }
    }

    coordinator.cleanup().await;
    Ok(())
}
