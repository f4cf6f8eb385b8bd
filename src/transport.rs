//! WebSocket transport channel for the duplex event protocol.
//!
//! Owns one connection to the room service and the loops that pump it:
//! outbound events are queued on an mpsc channel and written as JSON text
//! frames; inbound frames are decoded and delivered, in receipt order,
//! through a second mpsc channel. A dropped link is redialed with a
//! bounded attempt budget and fixed backoff; the owner sees the drop and
//! recovery as [`ChannelEvent`] variants and decides what they mean for
//! the session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::protocol::{ClientEvent, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_BUFFER: usize = 256;
const INBOUND_BUFFER: usize = 256;

// ── Link state ────────────────────────────────────────────────────

/// Lifecycle of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection yet.
    Disconnected,
    /// Dialing the initial connection.
    Connecting,
    /// Link up, loops running.
    Connected,
    /// Link dropped; redialing within the retry budget.
    Reconnecting,
    /// Retry budget exhausted.
    Failed,
    /// Torn down locally; a later connect starts fresh.
    Closed,
}

// ── Reconnect policy ──────────────────────────────────────────────

/// Bounded retry with fixed backoff.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(1000),
        }
    }
}

impl From<&ServerConfig> for ReconnectPolicy {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_attempts: config.reconnect_attempts.max(1),
            delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }
}

// ── Channel events ────────────────────────────────────────────────

/// What the channel delivers to its owner: decoded protocol events plus
/// link-level signals.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A decoded protocol event, in receipt order.
    Event(ServerEvent),
    /// The link dropped; attempt `attempt` of the budget is starting.
    Reconnecting { attempt: u32 },
    /// The link came back after a drop.
    Reconnected,
    /// The link is gone for good.
    Down(String),
}

// ── Transport seam ────────────────────────────────────────────────

/// Duplex event transport, injected into the session controller so the
/// controller never reaches for ambient connection state.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Establish the connection. Idempotent: a live channel is reused.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Queue one outbound event. Events queued while the link is being
    /// re-established are buffered and flushed in order.
    async fn emit(&self, event: ClientEvent) -> Result<(), TransportError>;

    /// Next inbound channel event. `None` once the channel is torn down.
    async fn next_event(&self) -> Option<ChannelEvent>;

    /// Tear down and clear state so a later [`connect`](Self::connect)
    /// starts fresh.
    async fn disconnect(&self);

    fn state(&self) -> LinkState;
}

// ── WebSocket channel ─────────────────────────────────────────────

/// [`EventTransport`] over a tokio-tungstenite WebSocket.
pub struct WsChannel {
    url: String,
    policy: ReconnectPolicy,
    state: Arc<parking_lot::Mutex<LinkState>>,
    out_tx: parking_lot::Mutex<Option<mpsc::Sender<ClientEvent>>>,
    event_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
}

impl WsChannel {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            url: url.into(),
            policy,
            state: Arc::new(parking_lot::Mutex::new(LinkState::Disconnected)),
            out_tx: parking_lot::Mutex::new(None),
            event_rx: tokio::sync::Mutex::new(None),
        }
    }

    fn set_state(state: &parking_lot::Mutex<LinkState>, next: LinkState) {
        *state.lock() = next;
    }

    /// Dial with the retry budget. Used for the initial connection; the
    /// link task runs its own copy of this loop for redials.
    async fn dial(url: &str, policy: &ReconnectPolicy) -> Result<WsStream, TransportError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match connect_async(url).await {
                Ok((ws, _response)) => {
                    tracing::info!(url, attempt, "connected to room service");
                    return Ok(ws);
                }
                Err(e) if attempt >= policy.max_attempts => {
                    tracing::error!(url, attempt, error = %e, "connection attempts exhausted");
                    return Err(TransportError::RetriesExhausted { attempts: attempt });
                }
                Err(e) => {
                    tracing::warn!(url, attempt, error = %e, "connection attempt failed");
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    /// Pump one live socket until it drops or is closed locally.
    async fn drive(
        ws: WsStream,
        out_rx: &mut mpsc::Receiver<ClientEvent>,
        event_tx: &mpsc::Sender<ChannelEvent>,
    ) -> LinkDrop {
        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                outbound = out_rx.recv() => match outbound {
                    Some(event) => {
                        let frame = match event.to_frame() {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::error!(error = %e, "failed to encode outbound event");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                            return LinkDrop::Lost(format!("send failed: {e}"));
                        }
                    }
                    // Sender side dropped: local disconnect.
                    None => {
                        let _ = sink.close().await;
                        return LinkDrop::LocalClose;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if Self::deliver_frame(text.as_str(), event_tx).await.is_err() {
                            return LinkDrop::ReceiverGone;
                        }
                    }
                    // Some runtimes ship JSON in binary frames; accept them.
                    Some(Ok(WsMessage::Binary(data))) if data.first() == Some(&b'{') => {
                        match std::str::from_utf8(&data) {
                            Ok(text) => {
                                if Self::deliver_frame(text, event_tx).await.is_err() {
                                    return LinkDrop::ReceiverGone;
                                }
                            }
                            Err(_) => {
                                tracing::warn!(len = data.len(), "non-UTF-8 binary frame, skipping");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        tracing::warn!(len = data.len(), "unexpected binary frame, skipping");
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        return LinkDrop::Lost(format!("closed by server: {frame:?}"));
                    }
                    Some(Ok(_)) => {
                        // Ping/pong handled by tungstenite.
                    }
                    Some(Err(e)) => {
                        return LinkDrop::Lost(format!("socket error: {e}"));
                    }
                    None => {
                        return LinkDrop::Lost("stream ended".into());
                    }
                },
            }
        }
    }

    async fn deliver_frame(
        text: &str,
        event_tx: &mpsc::Sender<ChannelEvent>,
    ) -> Result<(), mpsc::error::SendError<ChannelEvent>> {
        let event = match ServerEvent::from_frame(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, frame = %text, "undecodable frame");
                ServerEvent::Error {
                    message: format!("undecodable frame: {e}"),
                    recoverable: true,
                }
            }
        };
        event_tx.send(ChannelEvent::Event(event)).await
    }

    /// Link task: pump the socket, redial on drops, stop on local close.
    async fn run_link(
        mut ws: WsStream,
        url: String,
        policy: ReconnectPolicy,
        mut out_rx: mpsc::Receiver<ClientEvent>,
        event_tx: mpsc::Sender<ChannelEvent>,
        state: Arc<parking_lot::Mutex<LinkState>>,
    ) {
        loop {
            match Self::drive(ws, &mut out_rx, &event_tx).await {
                LinkDrop::LocalClose => {
                    Self::set_state(&state, LinkState::Closed);
                    tracing::debug!("transport closed locally");
                    return;
                }
                LinkDrop::ReceiverGone => {
                    Self::set_state(&state, LinkState::Closed);
                    tracing::debug!("event receiver dropped, closing link");
                    return;
                }
                LinkDrop::Lost(reason) => {
                    tracing::warn!(reason = %reason, "link dropped, redialing");
                    Self::set_state(&state, LinkState::Reconnecting);
                    let mut attempt = 0;
                    ws = loop {
                        attempt += 1;
                        if event_tx
                            .send(ChannelEvent::Reconnecting { attempt })
                            .await
                            .is_err()
                        {
                            Self::set_state(&state, LinkState::Closed);
                            return;
                        }
                        match connect_async(&url).await {
                            Ok((ws, _response)) => {
                                Self::set_state(&state, LinkState::Connected);
                                let _ = event_tx.send(ChannelEvent::Reconnected).await;
                                tracing::info!(url = %url, attempt, "link re-established");
                                break ws;
                            }
                            Err(e) if attempt >= policy.max_attempts => {
                                Self::set_state(&state, LinkState::Failed);
                                let _ = event_tx
                                    .send(ChannelEvent::Down(format!(
                                        "gave up after {attempt} attempts: {e}"
                                    )))
                                    .await;
                                return;
                            }
                            Err(e) => {
                                tracing::warn!(attempt, error = %e, "redial failed");
                                tokio::time::sleep(policy.delay).await;
                            }
                        }
                    };
                }
            }
        }
    }
}

enum LinkDrop {
    /// Outbound sender dropped — `disconnect()` was called.
    LocalClose,
    /// Nobody is consuming events anymore.
    ReceiverGone,
    /// The socket died underneath us.
    Lost(String),
}

#[async_trait]
impl EventTransport for WsChannel {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.out_tx.lock().is_some()
            && matches!(
                self.state(),
                LinkState::Connecting | LinkState::Connected | LinkState::Reconnecting
            )
        {
            return Ok(());
        }

        Self::set_state(&self.state, LinkState::Connecting);
        let ws = match Self::dial(&self.url, &self.policy).await {
            Ok(ws) => ws,
            Err(e) => {
                Self::set_state(&self.state, LinkState::Failed);
                return Err(e);
            }
        };

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(INBOUND_BUFFER);
        *self.out_tx.lock() = Some(out_tx);
        *self.event_rx.lock().await = Some(event_rx);
        Self::set_state(&self.state, LinkState::Connected);

        tokio::spawn(Self::run_link(
            ws,
            self.url.clone(),
            self.policy,
            out_rx,
            event_tx,
            Arc::clone(&self.state),
        ));
        Ok(())
    }

    async fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        let tx = self
            .out_tx
            .lock()
            .clone()
            .ok_or(TransportError::ChannelClosed)?;
        tx.send(event)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn next_event(&self) -> Option<ChannelEvent> {
        let mut guard = self.event_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn disconnect(&self) {
        // Dropping the sender lets the link task flush pending outbound
        // events (the end-session notice among them) before it closes.
        let had_link = self.out_tx.lock().take().is_some();
        self.event_rx.lock().await.take();
        if had_link {
            tracing::debug!("transport disconnect requested");
        }
        Self::set_state(&self.state, LinkState::Closed);
    }

    fn state(&self) -> LinkState {
        *self.state.lock()
    }
}

// ── Tests ─────────────────────────────────────────────────────────
