//! Parlor: press-to-talk client for multi-agent voice conversation rooms.
//!
//! Hold the record control, speak, release: the utterance ships to the
//! room service, each agent answers with text and synthesized speech,
//! and the replies play back strictly in arrival order while the
//! session clock counts down.
//!
//! ## Architecture
//!
//! ```text
//! microphone ─▸ Recorder ─▸ SessionController ─▸ WsChannel ─▸ room service
//!                                  │                 │
//!                                  ◂── ServerEvent ──┘
//!                                  │
//!                                  └─▸ PlaybackQueue ─▸ speaker
//! ```
//!
//! The [`session::SessionController`] owns all session state and
//! serializes every mutation (inbound events, the countdown tick, and
//! user commands) onto one `select!` loop. The transport is injected
//! behind [`transport::EventTransport`]; capture and playback live in
//! [`audio`]; the room catalog and transcript store are thin
//! collaborators in [`rooms`] and [`history`].

pub mod audio;
pub mod config;
pub mod error;
pub mod history;
pub mod protocol;
pub mod rooms;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{CaptureError, CatalogError, HistoryError, SessionError, TransportError};
pub use session::{SessionCommand, SessionController, SessionNotice, SessionState};
