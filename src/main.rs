//! Terminal front end: list rooms, join one, talk.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use parlor::audio::{CaptureConfig, CpalSink, Recorder, spawn_player};
use parlor::history::{format_duration, TranscriptLog, TranscriptStore};
use parlor::rooms::{Room, RoomCatalog};
use parlor::session::{
    EndReason, SessionCommand, SessionController, SessionNotice, SessionState,
};
use parlor::transport::{ReconnectPolicy, WsChannel};
use parlor::Config;

#[derive(Parser)]
#[command(
    name = "parlor",
    version,
    about = "Press-to-talk client for multi-agent voice conversation rooms"
)]
struct Cli {
    /// Config file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the HTTP API base URL.
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Override the WebSocket endpoint.
    #[arg(long, global = true)]
    ws_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available rooms.
    Rooms,
    /// Join a room and start talking (defaults to the first room).
    Join {
        /// Room name, matched case-insensitively.
        name: Option<String>,
    },
    /// List saved transcripts.
    Transcripts,
    /// Print one saved transcript.
    Show { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parlor=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(api_url) = &cli.api_url {
        config.server.api_url = api_url.clone();
    }
    if let Some(ws_url) = &cli.ws_url {
        config.server.ws_url = ws_url.clone();
    }

    match cli.command {
        Command::Rooms => list_rooms(&config).await,
        Command::Join { name } => join(&config, name.as_deref()).await,
        Command::Transcripts => list_transcripts(),
        Command::Show { id } => show_transcript(&id),
    }
}

async fn list_rooms(config: &Config) -> anyhow::Result<()> {
    let catalog = RoomCatalog::new(&config.server.api_url);
    let rooms = catalog.list().await.context("fetching room catalog")?;
    if rooms.is_empty() {
        println!("No rooms available.");
        return Ok(());
    }
    for room in &rooms {
        let agents: Vec<&str> = room.agents.iter().map(|a| a.name.as_str()).collect();
        println!(
            "{:<20} {:>2} min  [{}]",
            room.name,
            room.session_duration_minutes,
            agents.join(", ")
        );
        if let Some(description) = &room.description {
            println!("    {description}");
        }
    }
    Ok(())
}

async fn pick_room(config: &Config, name: Option<&str>) -> anyhow::Result<Room> {
    let catalog = RoomCatalog::new(&config.server.api_url);
    let rooms = catalog.list().await.context("fetching room catalog")?;
    match name {
        Some(name) => rooms
            .into_iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .with_context(|| format!("no room named {name:?}")),
        None => rooms.into_iter().next().context("no rooms available"),
    }
}

async fn join(config: &Config, name: Option<&str>) -> anyhow::Result<()> {
    let room = pick_room(config, name).await?;
    println!(
        "Joining {:?} ({} min). Press Enter to start/stop recording, 'q' to leave.",
        room.name, room.session_duration_minutes
    );

    let transport = WsChannel::new(
        config.server.ws_url.clone(),
        ReconnectPolicy::from(&config.server),
    );
    let playback = spawn_player(CpalSink);
    let (notices_tx, mut notices) = mpsc::channel(256);
    let (commands_tx, commands_rx) = mpsc::channel(16);

    let mut controller = SessionController::new(room, transport, playback, notices_tx);
    controller.start().await?;
    let session = tokio::spawn(controller.run(commands_rx));

    let mut recorder = Recorder::new(CaptureConfig::from(&config.audio));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Some(notice) => {
                    let done = matches!(notice, SessionNotice::Ended { .. });
                    print_notice(&notice);
                    if done {
                        break;
                    }
                }
                None => break,
            },
            line = lines.next_line(), if stdin_open => {
                let line = line?;
                match line.as_deref() {
                    Some("q") | Some("quit") | Some("exit") | None => {
                        stdin_open = line.is_some();
                        recorder.cancel();
                        let _ = commands_tx.send(SessionCommand::End).await;
                    }
                    Some(_) => handle_record_toggle(&mut recorder, &commands_tx).await,
                }
            },
            _ = tokio::signal::ctrl_c() => {
                recorder.cancel();
                let _ = commands_tx.send(SessionCommand::End).await;
            }
        }
    }

    let report = session.await.context("session task failed")?;
    if report.state == SessionState::Ended && !report.messages.is_empty() {
        let log = TranscriptLog::from_report(&report);
        match TranscriptStore::open_default().and_then(|store| store.save(&log)) {
            Ok(path) => println!("Transcript saved to {}", path.display()),
            Err(e) => eprintln!("Could not save transcript: {e}"),
        }
    }
    Ok(())
}

/// Enter toggles the gesture: first press begins capture, second press
/// ends it and submits the utterance.
async fn handle_record_toggle(
    recorder: &mut Recorder,
    commands: &mpsc::Sender<SessionCommand>,
) {
    if recorder.is_recording() {
        println!("… processing");
        match recorder.end_capture().await {
            Ok(utterance) => {
                let _ = commands.send(SessionCommand::Submit(utterance)).await;
            }
            Err(e) => println!("{}", e.user_message()),
        }
    } else {
        match recorder.begin_capture() {
            Ok(()) => println!("● recording, press Enter to send"),
            Err(e) => println!("{}", e.user_message()),
        }
    }
}

fn print_notice(notice: &SessionNotice) {
    match notice {
        SessionNotice::Started {
            room,
            duration_secs,
        } => {
            println!("Session started: {room} ({})", format_duration(*duration_secs));
        }
        SessionNotice::UserTurn { text } => println!("you: {text}"),
        SessionNotice::AgentTurn { agent, text } => match agent {
            Some(agent) => println!("{agent}: {text}"),
            None => println!("host: {text}"),
        },
        SessionNotice::AgentStatus { agent, status } => println!("[{agent} is {status}]"),
        SessionNotice::Status { message } => println!("[{message}]"),
        SessionNotice::TurnComplete => println!("[ready for your next question]"),
        SessionNotice::Tick { remaining_secs } => {
            // Keep the countdown quiet except at minute marks and the
            // final stretch.
            if *remaining_secs % 60 == 0 || *remaining_secs <= 10 {
                println!("[{} remaining]", format_duration(*remaining_secs));
            }
        }
        SessionNotice::Recoverable { message } => println!("[warning: {message}]"),
        SessionNotice::Ended { reason } => match reason {
            EndReason::TimeExpired => println!("Session ended: time is up. Conversation saved!"),
            EndReason::ServerEnded => println!("Session ended by the service. Conversation saved!"),
            EndReason::UserEnded => println!("Session ended. Conversation saved!"),
            EndReason::Fatal(message) => println!("Session failed: {message}"),
        },
    }
}

fn list_transcripts() -> anyhow::Result<()> {
    let store = TranscriptStore::open_default()?;
    let summaries = store.list()?;
    if summaries.is_empty() {
        println!("No saved transcripts.");
        return Ok(());
    }
    for s in summaries {
        println!(
            "{:<40} {}  {:>6}  {:>3} msgs  {}",
            s.id, s.date, s.duration, s.message_count, s.preview
        );
    }
    Ok(())
}

fn show_transcript(id: &str) -> anyhow::Result<()> {
    let store = TranscriptStore::open_default()?;
    let log = store.load(id)?;
    println!(
        "{} — {}  ({})",
        log.room,
        log.start_time.format("%Y-%m-%d %H:%M"),
        format_duration(log.duration_seconds)
    );
    for message in &log.conversation {
        let speaker = message
            .agent
            .clone()
            .unwrap_or_else(|| match message.role {
                parlor::session::Role::User => "you".to_string(),
                parlor::session::Role::Assistant => "host".to_string(),
            });
        println!("[{}] {speaker}: {}", message.timestamp.format("%H:%M:%S"), message.content);
    }
    Ok(())
}
