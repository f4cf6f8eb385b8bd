//! Session controller: the state machine that owns one conversation.
//!
//! ```text
//! Idle ─▸ Connecting ─▸ Active ─▸ Ending ─▸ Ended
//!             │            │
//!             └────────────┴──▸ Errored (absorbing)
//! ```
//!
//! The controller is the only mutator of session state. Inbound channel
//! events, the one-second countdown, and user commands all serialize
//! onto a single `select!` loop, so an authoritative `remaining_time`
//! carried on a response can never race a concurrently-ticking local
//! countdown. The transport is an injected [`EventTransport`] instance,
//! not an ambient singleton.

use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::audio::{EncodedUtterance, PlayerHandle};
use crate::error::SessionError;
use crate::protocol::{ClientEvent, RosterEntry, ServerEvent};
use crate::rooms::Room;
use crate::transport::{ChannelEvent, EventTransport};

// ── Transcript types ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn in the visible transcript. The log is append-only for the
/// lifetime of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Originating agent, assistant turns only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ── Lifecycle ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Ending,
    Ended,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Errored)
    }
}

/// Why the session reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    TimeExpired,
    ServerEnded,
    UserEnded,
    Fatal(String),
}

// ── UI surface ────────────────────────────────────────────────────

/// Non-blocking user-visible notices (transient toasts in a GUI, status
/// lines in the CLI).
#[derive(Debug, Clone)]
pub enum SessionNotice {
    Started { room: String, duration_secs: u64 },
    UserTurn { text: String },
    AgentTurn { agent: Option<String>, text: String },
    AgentStatus { agent: String, status: String },
    Status { message: String },
    /// All agents replied; the record control re-enables.
    TurnComplete,
    Tick { remaining_secs: u64 },
    Recoverable { message: String },
    Ended { reason: EndReason },
}

/// Commands from the session view.
#[derive(Debug)]
pub enum SessionCommand {
    Submit(EncodedUtterance),
    End,
}

/// Final snapshot handed back when the controller finishes.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub room: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub reason: EndReason,
    pub state: SessionState,
}

// ── Controller ────────────────────────────────────────────────────

pub struct SessionController<T: EventTransport> {
    transport: T,
    playback: PlayerHandle,
    room: Room,
    session_id: String,
    state: SessionState,
    messages: Vec<Message>,
    roster: Vec<RosterEntry>,
    remaining_secs: u64,
    processing: bool,
    started_at: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
    notices: mpsc::Sender<SessionNotice>,
}

impl<T: EventTransport> SessionController<T> {
    pub fn new(
        room: Room,
        transport: T,
        playback: PlayerHandle,
        notices: mpsc::Sender<SessionNotice>,
    ) -> Self {
        Self {
            transport,
            playback,
            room,
            session_id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Idle,
            messages: Vec::new(),
            roster: Vec::new(),
            remaining_secs: 0,
            processing: false,
            started_at: None,
            end_reason: None,
            notices,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn remaining_secs(&self) -> u64 {
        self.remaining_secs
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    /// `Idle → Connecting`: open the channel and request the session.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Ok(());
        }
        self.state = SessionState::Connecting;
        tracing::info!(
            session_id = %self.session_id,
            room = %self.room.name,
            "starting session"
        );

        if let Err(e) = self.transport.connect().await {
            self.fail(format!("connect failed: {e}")).await;
            return Err(e.into());
        }
        if let Err(e) = self.emit_start_session().await {
            self.fail(format!("handshake emit failed: {e}")).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Drive the session to a terminal state and return the final
    /// transcript snapshot.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) -> SessionReport {
        enum Wake {
            Tick,
            Channel(Option<ChannelEvent>),
            Command(Option<SessionCommand>),
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.state.is_terminal() {
            let before = self.state;
            let wake = tokio::select! {
                _ = ticker.tick(), if self.state == SessionState::Active => Wake::Tick,
                event = self.transport.next_event() => Wake::Channel(event),
                command = commands.recv() => Wake::Command(command),
            };
            match wake {
                Wake::Tick => self.tick().await,
                Wake::Channel(Some(event)) => self.handle_channel_event(event).await,
                Wake::Channel(None) => self.fail("transport closed".into()).await,
                Wake::Command(Some(SessionCommand::Submit(utterance))) => {
                    if let Err(e) = self.submit(utterance).await {
                        if e.is_recoverable() {
                            self.notify(SessionNotice::Recoverable {
                                message: e.to_string(),
                            })
                            .await;
                        } else {
                            self.fail(e.to_string()).await;
                        }
                    }
                }
                Wake::Command(Some(SessionCommand::End)) | Wake::Command(None) => {
                    self.shutdown(EndReason::UserEnded).await;
                }
            }
            // The interval's pending tick would fire the instant the
            // guard flips on; realign it so the first decrement lands a
            // full second after activation.
            if before == SessionState::Connecting && self.state == SessionState::Active {
                ticker.reset();
            }
        }

        self.into_report()
    }

    fn into_report(self) -> SessionReport {
        SessionReport {
            room: self.room.name,
            started_at: self.started_at,
            ended_at: Utc::now(),
            messages: self.messages,
            reason: self.end_reason.unwrap_or(EndReason::UserEnded),
            state: self.state,
        }
    }

    // ── Outbound ──────────────────────────────────────────────────

    async fn emit_start_session(&self) -> Result<(), SessionError> {
        self.transport
            .emit(ClientEvent::StartSession {
                room: self.room.clone(),
            })
            .await?;
        Ok(())
    }

    /// Forward one captured utterance. Rejected while a previous turn is
    /// still processing, so overlapping submissions never reach the wire.
    async fn submit(&mut self, utterance: EncodedUtterance) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive);
        }
        if self.processing {
            return Err(SessionError::TurnInFlight);
        }
        self.transport
            .emit(ClientEvent::ProcessAudio {
                audio: utterance.audio,
            })
            .await?;
        self.processing = true;
        tracing::info!(
            session_id = %self.session_id,
            bytes = utterance.raw_bytes,
            "utterance submitted"
        );
        Ok(())
    }

    // ── State mutation (single logical update path) ───────────────

    async fn tick(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        self.remaining_secs = self.remaining_secs.saturating_sub(1);
        self.notify(SessionNotice::Tick {
            remaining_secs: self.remaining_secs,
        })
        .await;
        if self.remaining_secs == 0 {
            tracing::info!(session_id = %self.session_id, "time budget exhausted");
            self.shutdown(EndReason::TimeExpired).await;
        }
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event {
            ChannelEvent::Event(event) => self.handle_server_event(event).await,
            ChannelEvent::Reconnecting { attempt } => {
                self.notify(SessionNotice::Recoverable {
                    message: format!("connection lost, reconnecting (attempt {attempt})"),
                })
                .await;
            }
            ChannelEvent::Reconnected => {
                if self.state == SessionState::Connecting {
                    // The ack never arrived on the old link; the redial
                    // is a fresh handshake.
                    if let Err(e) = self.emit_start_session().await {
                        self.fail(format!("handshake emit failed: {e}")).await;
                    }
                } else {
                    self.notify(SessionNotice::Recoverable {
                        message: "connection restored".into(),
                    })
                    .await;
                }
            }
            ChannelEvent::Down(reason) => self.fail(reason).await,
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionStarted {
                room,
                duration,
                agents,
                greeting,
            } => {
                if self.state != SessionState::Connecting {
                    tracing::debug!(
                        session_id = %self.session_id,
                        state = ?self.state,
                        "ignoring session_started outside handshake"
                    );
                    return;
                }
                self.state = SessionState::Active;
                self.started_at = Some(Utc::now());
                self.remaining_secs = duration * 60;
                self.roster = agents;
                tracing::info!(
                    session_id = %self.session_id,
                    room = %room,
                    duration_min = duration,
                    "session active"
                );
                self.notify(SessionNotice::Started {
                    room,
                    duration_secs: self.remaining_secs,
                })
                .await;
                self.push_message(Role::Assistant, greeting, None).await;
            }

            ServerEvent::Transcription { text } => {
                self.push_message(Role::User, text, None).await;
            }

            ServerEvent::Status { message, kind } => {
                tracing::debug!(session_id = %self.session_id, kind = %kind, "status");
                self.notify(SessionNotice::Status { message }).await;
            }

            ServerEvent::AgentStatus { agent, status, .. } => {
                self.notify(SessionNotice::AgentStatus { agent, status })
                    .await;
            }

            ServerEvent::AgentResponse {
                agent,
                text,
                audio,
                remaining_time,
                ..
            } => {
                self.push_message(Role::Assistant, text, Some(agent.clone()))
                    .await;
                if let Some(audio) = audio {
                    match base64::engine::general_purpose::STANDARD.decode(audio.as_bytes()) {
                        Ok(bytes) => self.playback.enqueue(bytes).await,
                        Err(e) => tracing::warn!(
                            session_id = %self.session_id,
                            agent = %agent,
                            error = %e,
                            "undecodable audio payload, skipping playback"
                        ),
                    }
                }
                // Server time is the source of truth; the local
                // countdown is advisory between responses.
                self.remaining_secs = remaining_time;
            }

            ServerEvent::ProcessingComplete { remaining_time, .. } => {
                self.processing = false;
                self.remaining_secs = remaining_time;
                self.notify(SessionNotice::TurnComplete).await;
            }

            ServerEvent::SessionExpired { message } => {
                tracing::info!(session_id = %self.session_id, message = %message, "session expired");
                self.shutdown(EndReason::TimeExpired).await;
            }

            ServerEvent::SessionEnded { .. } => {
                self.shutdown(EndReason::ServerEnded).await;
            }

            ServerEvent::Error {
                message,
                recoverable,
            } => {
                if recoverable {
                    tracing::warn!(session_id = %self.session_id, error = %message, "recoverable service error");
                    self.notify(SessionNotice::Recoverable { message }).await;
                } else {
                    self.fail(message).await;
                }
            }
        }
    }

    async fn push_message(&mut self, role: Role, content: String, agent: Option<String>) {
        self.messages.push(Message {
            role,
            content: content.clone(),
            agent: agent.clone(),
            timestamp: Utc::now(),
        });
        let notice = match role {
            Role::User => SessionNotice::UserTurn { text: content },
            Role::Assistant => SessionNotice::AgentTurn {
                agent,
                text: content,
            },
        };
        self.notify(notice).await;
    }

    async fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice).await;
    }

    // ── Teardown ──────────────────────────────────────────────────

    async fn shutdown(&mut self, reason: EndReason) {
        self.teardown(reason, SessionState::Ended).await;
    }

    async fn fail(&mut self, message: String) {
        tracing::error!(session_id = %self.session_id, error = %message, "session failed");
        self.teardown(EndReason::Fatal(message), SessionState::Errored)
            .await;
    }

    async fn teardown(&mut self, reason: EndReason, terminal: SessionState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = SessionState::Ending;
        // Best-effort: delivery of the end notice is not guaranteed.
        let _ = self.transport.emit(ClientEvent::EndSession).await;
        self.transport.disconnect().await;
        self.state = terminal;
        self.end_reason = Some(reason.clone());
        tracing::info!(session_id = %self.session_id, reason = ?reason, "session over");
        self.notify(SessionNotice::Ended { reason }).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{spawn_player, AudioSegment, AudioSink, EncodingFormat};
    use crate::error::TransportError;
    use crate::transport::LinkState;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct MockTransport {
        emitted: Arc<parking_lot::Mutex<Vec<ClientEvent>>>,
        events: tokio::sync::Mutex<mpsc::Receiver<ChannelEvent>>,
        disconnected: Arc<parking_lot::Mutex<bool>>,
    }

    struct MockHandles {
        events_tx: mpsc::Sender<ChannelEvent>,
        emitted: Arc<parking_lot::Mutex<Vec<ClientEvent>>>,
        disconnected: Arc<parking_lot::Mutex<bool>>,
    }

    fn mock_transport() -> (MockTransport, MockHandles) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let emitted = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let disconnected = Arc::new(parking_lot::Mutex::new(false));
        (
            MockTransport {
                emitted: Arc::clone(&emitted),
                events: tokio::sync::Mutex::new(events_rx),
                disconnected: Arc::clone(&disconnected),
            },
            MockHandles {
                events_tx,
                emitted,
                disconnected,
            },
        )
    }

    #[async_trait]
    impl EventTransport for MockTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
            self.emitted.lock().push(event);
            Ok(())
        }

        async fn next_event(&self) -> Option<ChannelEvent> {
            self.events.lock().await.recv().await
        }

        async fn disconnect(&self) {
            *self.disconnected.lock() = true;
        }

        fn state(&self) -> LinkState {
            LinkState::Connected
        }
    }

    struct CollectingSink {
        played: Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl AudioSink for CollectingSink {
        async fn play(&mut self, segment: &AudioSegment) -> anyhow::Result<()> {
            self.played.lock().push(segment.data.clone());
            Ok(())
        }
    }

    struct Fixture {
        controller: SessionController<MockTransport>,
        handles: MockHandles,
        notices_rx: mpsc::Receiver<SessionNotice>,
        played: Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
    }

    fn strategy_room() -> Room {
        Room {
            name: "Strategy".into(),
            description: None,
            agents: vec![],
            session_duration_minutes: 5,
            greeting: "Hi".into(),
        }
    }

    fn fixture() -> Fixture {
        let (transport, handles) = mock_transport();
        let played = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let playback = spawn_player(CollectingSink {
            played: Arc::clone(&played),
        });
        let (notices_tx, notices_rx) = mpsc::channel(256);
        let controller = SessionController::new(strategy_room(), transport, playback, notices_tx);
        Fixture {
            controller,
            handles,
            notices_rx,
            played,
        }
    }

    fn started_event() -> ServerEvent {
        ServerEvent::SessionStarted {
            room: "Strategy".into(),
            duration: 5,
            agents: vec![RosterEntry {
                name: "Analyst".into(),
                voice: Some("aura-asteria-en".into()),
            }],
            greeting: "Hi".into(),
        }
    }

    async fn activate(fx: &mut Fixture) {
        fx.controller.start().await.unwrap();
        fx.controller.handle_server_event(started_event()).await;
        assert_eq!(fx.controller.state(), SessionState::Active);
    }

    fn test_utterance() -> EncodedUtterance {
        EncodedUtterance {
            audio: "UklGRg==".into(),
            format: EncodingFormat::Wav,
            sample_rate: 16_000,
            raw_bytes: 4,
        }
    }

    #[tokio::test]
    async fn handshake_seeds_greeting_and_countdown() {
        let mut fx = fixture();
        fx.controller.start().await.unwrap();
        assert_eq!(fx.controller.state(), SessionState::Connecting);
        assert!(matches!(
            fx.handles.emitted.lock()[0],
            ClientEvent::StartSession { .. }
        ));

        fx.controller.handle_server_event(started_event()).await;
        assert_eq!(fx.controller.state(), SessionState::Active);
        assert_eq!(fx.controller.remaining_secs(), 300);
        assert_eq!(fx.controller.roster().len(), 1);

        let log = fx.controller.messages();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].role, Role::Assistant);
        assert_eq!(log[0].content, "Hi");
        assert!(log[0].agent.is_none());
    }

    #[tokio::test]
    async fn countdown_decrements_once_per_tick() {
        let mut fx = fixture();
        activate(&mut fx).await;
        for _ in 0..3 {
            fx.controller.tick().await;
        }
        assert_eq!(fx.controller.remaining_secs(), 297);
    }

    #[tokio::test]
    async fn authoritative_time_overrides_local_countdown() {
        let mut fx = fixture();
        activate(&mut fx).await;
        fx.controller.tick().await;
        fx.controller.tick().await;

        fx.controller
            .handle_server_event(ServerEvent::AgentResponse {
                agent: "Analyst".into(),
                text: "Consider the risks.".into(),
                audio: None,
                voice: None,
                remaining_time: 290,
                agent_index: 0,
                total_agents: 1,
            })
            .await;
        assert_eq!(fx.controller.remaining_secs(), 290);

        // Local ticking resumes from the authoritative value.
        fx.controller.tick().await;
        assert_eq!(fx.controller.remaining_secs(), 289);
    }

    #[tokio::test]
    async fn agent_response_appends_and_enqueues_audio() {
        let mut fx = fixture();
        activate(&mut fx).await;

        let payload = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        fx.controller
            .handle_server_event(ServerEvent::AgentResponse {
                agent: "Analyst".into(),
                text: "Consider the risks.".into(),
                audio: Some(payload),
                voice: None,
                remaining_time: 280,
                agent_index: 0,
                total_agents: 1,
            })
            .await;

        let log = fx.controller.messages();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].agent.as_deref(), Some("Analyst"));

        // The player task picks the segment up asynchronously.
        for _ in 0..100 {
            if !fx.played.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*fx.played.lock(), vec![vec![1u8, 2, 3]]);
    }

    #[tokio::test]
    async fn transcription_appends_user_turn() {
        let mut fx = fixture();
        activate(&mut fx).await;
        fx.controller
            .handle_server_event(ServerEvent::Transcription {
                text: "what about pricing".into(),
            })
            .await;
        let log = fx.controller.messages();
        assert_eq!(log[1].role, Role::User);
        assert!(log[1].agent.is_none());
    }

    #[tokio::test]
    async fn recoverable_error_changes_nothing() {
        let mut fx = fixture();
        activate(&mut fx).await;
        let before = fx.controller.remaining_secs();

        fx.controller
            .handle_server_event(ServerEvent::Error {
                message: "Could not understand. Please try again.".into(),
                recoverable: true,
            })
            .await;

        assert_eq!(fx.controller.state(), SessionState::Active);
        assert_eq!(fx.controller.remaining_secs(), before);
        assert!(!*fx.handles.disconnected.lock());
    }

    #[tokio::test]
    async fn fatal_error_tears_down_the_channel() {
        let mut fx = fixture();
        activate(&mut fx).await;

        fx.controller
            .handle_server_event(ServerEvent::Error {
                message: "No active session".into(),
                recoverable: false,
            })
            .await;

        assert_eq!(fx.controller.state(), SessionState::Errored);
        assert!(*fx.handles.disconnected.lock());
        assert!(fx
            .handles
            .emitted
            .lock()
            .iter()
            .any(|e| matches!(e, ClientEvent::EndSession)));
    }

    #[tokio::test]
    async fn countdown_expiry_ends_the_session() {
        let mut fx = fixture();
        fx.controller.start().await.unwrap();
        fx.controller
            .handle_server_event(ServerEvent::SessionStarted {
                room: "Strategy".into(),
                duration: 5,
                agents: vec![],
                greeting: "Hi".into(),
            })
            .await;
        // Fast-forward to the edge, then tick over it.
        fx.controller.remaining_secs = 1;
        fx.controller.tick().await;

        assert_eq!(fx.controller.remaining_secs(), 0);
        assert_eq!(fx.controller.state(), SessionState::Ended);
        assert!(*fx.handles.disconnected.lock());
    }

    #[tokio::test]
    async fn processing_gates_submissions() {
        let mut fx = fixture();
        activate(&mut fx).await;

        fx.controller.submit(test_utterance()).await.unwrap();
        assert!(fx.controller.is_processing());
        assert!(matches!(
            fx.controller.submit(test_utterance()).await,
            Err(SessionError::TurnInFlight)
        ));

        let submissions = fx
            .handles
            .emitted
            .lock()
            .iter()
            .filter(|e| matches!(e, ClientEvent::ProcessAudio { .. }))
            .count();
        assert_eq!(submissions, 1);

        fx.controller
            .handle_server_event(ServerEvent::ProcessingComplete {
                total_agents: 1,
                remaining_time: 250,
            })
            .await;
        assert!(!fx.controller.is_processing());
        assert_eq!(fx.controller.remaining_secs(), 250);
        fx.controller.submit(test_utterance()).await.unwrap();
    }

    #[tokio::test]
    async fn submit_outside_active_is_rejected() {
        let mut fx = fixture();
        assert!(matches!(
            fx.controller.submit(test_utterance()).await,
            Err(SessionError::NotActive)
        ));
        assert!(fx.handles.emitted.lock().is_empty());
    }

    #[tokio::test]
    async fn session_expired_is_terminal() {
        let mut fx = fixture();
        activate(&mut fx).await;
        fx.controller
            .handle_server_event(ServerEvent::SessionExpired {
                message: "Session time limit reached".into(),
            })
            .await;
        assert_eq!(fx.controller.state(), SessionState::Ended);
        assert!(*fx.handles.disconnected.lock());
    }

    #[tokio::test]
    async fn no_resurrection_after_terminal_state() {
        let mut fx = fixture();
        activate(&mut fx).await;
        fx.controller
            .handle_server_event(ServerEvent::SessionEnded {
                message: "Session saved".into(),
            })
            .await;
        assert_eq!(fx.controller.state(), SessionState::Ended);

        fx.controller.handle_channel_event(ChannelEvent::Event(started_event())).await;
        assert_eq!(fx.controller.state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn reconnect_during_handshake_resends_start() {
        let mut fx = fixture();
        fx.controller.start().await.unwrap();
        fx.controller
            .handle_channel_event(ChannelEvent::Reconnected)
            .await;
        let starts = fx
            .handles
            .emitted
            .lock()
            .iter()
            .filter(|e| matches!(e, ClientEvent::StartSession { .. }))
            .count();
        assert_eq!(starts, 2);
        assert_eq!(fx.controller.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn reconnect_while_active_is_a_notice_only() {
        let mut fx = fixture();
        activate(&mut fx).await;
        fx.controller
            .handle_channel_event(ChannelEvent::Reconnecting { attempt: 1 })
            .await;
        fx.controller
            .handle_channel_event(ChannelEvent::Reconnected)
            .await;
        assert_eq!(fx.controller.state(), SessionState::Active);
        let starts = fx
            .handles
            .emitted
            .lock()
            .iter()
            .filter(|e| matches!(e, ClientEvent::StartSession { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn run_loop_processes_events_in_order() {
        let mut fx = fixture();
        fx.controller.start().await.unwrap();

        let (_commands_tx, commands_rx) = mpsc::channel(8);
        let events_tx = fx.handles.events_tx.clone();
        let driver = tokio::spawn(async move {
            events_tx
                .send(ChannelEvent::Event(started_event()))
                .await
                .unwrap();
            events_tx
                .send(ChannelEvent::Event(ServerEvent::Transcription {
                    text: "hello agents".into(),
                }))
                .await
                .unwrap();
            events_tx
                .send(ChannelEvent::Event(ServerEvent::SessionEnded {
                    message: "Session saved".into(),
                }))
                .await
                .unwrap();
        });

        let report = fx.controller.run(commands_rx).await;
        driver.await.unwrap();

        assert_eq!(report.state, SessionState::Ended);
        assert_eq!(report.reason, EndReason::ServerEnded);
        assert_eq!(report.room, "Strategy");
        assert!(report.started_at.is_some());
        let contents: Vec<&str> = report.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hi", "hello agents"]);

        // Notices surfaced along the way, ending with the terminal one.
        let mut saw_ended = false;
        while let Ok(notice) = fx.notices_rx.try_recv() {
            if let SessionNotice::Ended { reason } = notice {
                assert_eq!(reason, EndReason::ServerEnded);
                saw_ended = true;
            }
        }
        assert!(saw_ended);
    }

    #[tokio::test]
    async fn user_end_command_is_graceful() {
        let mut fx = fixture();
        fx.controller.start().await.unwrap();
        fx.controller.handle_server_event(started_event()).await;

        let (commands_tx, commands_rx) = mpsc::channel(8);
        commands_tx.send(SessionCommand::End).await.unwrap();

        let report = fx.controller.run(commands_rx).await;
        assert_eq!(report.reason, EndReason::UserEnded);
        assert_eq!(report.state, SessionState::Ended);
        assert!(*fx.handles.disconnected.lock());
    }
}
