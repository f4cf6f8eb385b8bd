//! Audio capture and playback.
//!
//! Capture: one press-and-hold gesture produces one encoded utterance,
//! with chunked buffering while the gesture is held, minimum-duration and
//! minimum-size enforcement, then container + base64 encoding for the
//! wire. Playback: synthesized replies arrive faster than they can be
//! rendered and go through a strict-FIFO queue that plays exactly one
//! segment at a time.

pub mod capture;
pub mod playback;

pub use capture::{CaptureConfig, EncodedUtterance, EncodingFormat, Recorder, RecordingBuffer};
pub use playback::{spawn_player, AudioSegment, AudioSink, CpalSink, PlaybackQueue, PlayerHandle};
