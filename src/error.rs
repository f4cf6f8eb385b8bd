//! Error taxonomy for the parlor client.
//!
//! Three layers, matching where each failure is handled:
//! - [`CaptureError`]: local microphone/validation failures, absorbed at
//!   the capture boundary; they reset the record control and never become
//!   session state transitions.
//! - [`TransportError`]: connection-level failures, retried automatically
//!   up to a bound and then handed to the session controller.
//! - [`SessionError`]: controller-level rejections and wrapped transport
//!   failures; the controller decides terminality.

use thiserror::Error;

// ── Capture errors ────────────────────────────────────────────────

/// Failures from the audio capture pipeline.
///
/// All variants are recoverable by retrying the record gesture.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// The OS refused microphone access.
    #[error("microphone access denied")]
    PermissionDenied,

    /// No input device is present.
    #[error("no microphone found")]
    DeviceNotFound,

    /// A device exists but could not be opened or read.
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),

    /// The gesture ended with zero captured chunks.
    #[error("no audio recorded")]
    EmptyRecording,

    /// The assembled payload is below the minimum byte threshold.
    #[error("recording too short: {actual} bytes (minimum {min})")]
    RecordingTooShort { actual: usize, min: usize },

    /// The payload could not be written in the negotiated container.
    #[error("payload encoding failed: {0}")]
    Encode(String),
}

impl CaptureError {
    /// User-facing notice text.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Microphone access denied. Please allow microphone access and try again."
            }
            Self::DeviceNotFound => "No microphone found. Please connect a microphone and try again.",
            Self::DeviceUnavailable(_) => {
                "Could not access microphone. Please check your settings and try again."
            }
            Self::EmptyRecording => "No audio recorded",
            Self::RecordingTooShort { .. } => "Recording too short. Hold the button and speak.",
            Self::Encode(_) => "Could not encode the recording. Please try again.",
        }
    }
}

// ── Transport errors ──────────────────────────────────────────────

/// Failures from the duplex event channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A single connection attempt failed.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Every attempt in the retry budget failed.
    #[error("gave up connecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The channel was torn down while a send was pending.
    #[error("event channel closed")]
    ChannelClosed,

    /// An event could not be encoded for the wire.
    #[error("wire codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

// ── Session errors ────────────────────────────────────────────────

/// Controller-level failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An utterance was submitted while the previous turn was still
    /// being processed.
    #[error("previous turn still processing")]
    TurnInFlight,

    /// An utterance was submitted outside the Active state.
    #[error("session is not active")]
    NotActive,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Recoverable errors surface as transient notices; non-recoverable
    /// ones end the session.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TurnInFlight | Self::NotActive => true,
            Self::Transport(TransportError::RetriesExhausted { .. }) => false,
            Self::Transport(TransportError::ChannelClosed) => false,
            Self::Transport(_) => true,
        }
    }
}

// ── Collaborator errors ───────────────────────────────────────────

/// Failures from the HTTP collaborators (room catalog).
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("catalog service returned {status}: {message}")]
    Service { status: u16, message: String },
}

/// Failures from the transcript store.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("transcript io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcript codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("no transcript with id {0}")]
    NotFound(String),
}

// ── Tests ─────────────────────────────────────────────────────────
