//! Microphone capture pipeline.
//!
//! One [`Recorder`] lives as long as the session view. `begin_capture`
//! acquires the input device and buffers chunks while the gesture is
//! held; `end_capture` enforces the minimum gesture length, validates the
//! assembled payload, and returns it encoded for transport. Validation
//! failures never leave this module as anything but a [`CaptureError`];
//! the session controller only ever sees finished utterances.

use std::time::Duration;

use base64::Engine;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::Arc;
use tokio::time::Instant;

use crate::error::CaptureError;

// ── Configuration ─────────────────────────────────────────────────

/// Fixed capture constraints for one recorder instance.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Target sample rate; the device's native rate wins if this one is
    /// refused, and the payload header carries whichever was used.
    pub sample_rate: u32,
    /// Chunk interval for gesture buffering.
    pub chunk_interval_ms: u64,
    /// Gestures shorter than this are stretched before the stop.
    pub min_utterance_ms: u64,
    /// Minimum raw payload size worth transporting.
    pub min_payload_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_interval_ms: 250,
            min_utterance_ms: 1000,
            min_payload_bytes: 8000,
        }
    }
}

impl From<&crate::config::AudioConfig> for CaptureConfig {
    fn from(audio: &crate::config::AudioConfig) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            chunk_interval_ms: audio.chunk_interval_ms,
            min_utterance_ms: audio.min_utterance_ms,
            min_payload_bytes: audio.min_payload_bytes,
        }
    }
}

// ── Encoding negotiation ──────────────────────────────────────────

/// Transport container for the captured payload. Negotiated once per
/// recorder instance, never per utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingFormat {
    /// WAV container, 16-bit PCM.
    Wav,
    /// Raw little-endian 16-bit PCM, no header.
    Pcm16,
}

impl EncodingFormat {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Pcm16 => "audio/L16",
        }
    }

    fn encoder_available(self) -> bool {
        match self {
            Self::Wav => true,
            Self::Pcm16 => true,
        }
    }

    /// First supported format from the preference list; raw PCM is the
    /// last-resort fallback since it needs no encoder at all.
    pub fn negotiate(preferences: &[EncodingFormat]) -> EncodingFormat {
        preferences
            .iter()
            .copied()
            .find(|format| format.encoder_available())
            .unwrap_or(EncodingFormat::Pcm16)
    }
}

/// One finished utterance, encoded for transport.
#[derive(Debug, Clone)]
pub struct EncodedUtterance {
    /// Base64 payload as carried by the `process_audio` event.
    pub audio: String,
    pub format: EncodingFormat,
    pub sample_rate: u32,
    /// Raw payload size before base64, for logging.
    pub raw_bytes: usize,
}

// ── Recording buffer ──────────────────────────────────────────────

/// Transient state for one in-progress utterance: ordered captured
/// chunks plus the negotiated format. Created when the gesture begins,
/// consumed when it ends.
#[derive(Debug)]
pub struct RecordingBuffer {
    chunks: Vec<Vec<i16>>,
    format: EncodingFormat,
    sample_rate: u32,
}

impl RecordingBuffer {
    pub fn new(format: EncodingFormat, sample_rate: u32) -> Self {
        Self {
            chunks: Vec::new(),
            format,
            sample_rate,
        }
    }

    pub fn push_chunk(&mut self, samples: Vec<i16>) {
        if !samples.is_empty() {
            self.chunks.push(samples);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_samples(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Assemble, validate, and encode the buffered chunks. The buffer is
    /// empty afterwards whether or not validation passed.
    pub fn finish(&mut self, min_payload_bytes: usize) -> Result<EncodedUtterance, CaptureError> {
        let chunks = std::mem::take(&mut self.chunks);
        if chunks.is_empty() {
            return Err(CaptureError::EmptyRecording);
        }

        let samples: Vec<i16> = chunks.into_iter().flatten().collect();
        let raw_len = samples.len() * 2;
        if raw_len < min_payload_bytes {
            return Err(CaptureError::RecordingTooShort {
                actual: raw_len,
                min: min_payload_bytes,
            });
        }

        let bytes = encode_payload(&samples, self.sample_rate, self.format)?;
        let raw_bytes = bytes.len();
        Ok(EncodedUtterance {
            audio: base64::engine::general_purpose::STANDARD.encode(bytes),
            format: self.format,
            sample_rate: self.sample_rate,
            raw_bytes,
        })
    }
}

fn encode_payload(
    samples: &[i16],
    sample_rate: u32,
    format: EncodingFormat,
) -> Result<Vec<u8>, CaptureError> {
    match format {
        EncodingFormat::Wav => {
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut cursor = Cursor::new(Vec::new());
            {
                let mut writer = hound::WavWriter::new(&mut cursor, spec)
                    .map_err(|e| CaptureError::Encode(e.to_string()))?;
                for &sample in samples {
                    writer
                        .write_sample(sample)
                        .map_err(|e| CaptureError::Encode(e.to_string()))?;
                }
                writer
                    .finalize()
                    .map_err(|e| CaptureError::Encode(e.to_string()))?;
            }
            Ok(cursor.into_inner())
        }
        EncodingFormat::Pcm16 => {
            let mut bytes = Vec::with_capacity(samples.len() * 2);
            for &sample in samples {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            Ok(bytes)
        }
    }
}

// ── Sample plumbing ───────────────────────────────────────────────

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Fold interleaved frames down to mono i16.
fn fold_mono_f32(data: &[f32], channels: usize) -> Vec<i16> {
    data.chunks(channels)
        .map(|frame| f32_to_i16(frame.iter().sum::<f32>() / frame.len() as f32))
        .collect()
}

fn fold_mono_i16(data: &[i16], channels: usize) -> Vec<i16> {
    data.chunks(channels)
        .map(|frame| (frame.iter().map(|&s| i32::from(s)).sum::<i32>() / frame.len() as i32) as i16)
        .collect()
}

/// Cut full chunks off the pending sample run into the buffer; a partial
/// tail stays pending until the next callback or the final flush.
fn drain_chunks(pending: &mut Vec<i16>, chunk_samples: usize, buffer: &mut RecordingBuffer) {
    while pending.len() >= chunk_samples {
        let rest = pending.split_off(chunk_samples);
        let chunk = std::mem::replace(pending, rest);
        buffer.push_chunk(chunk);
    }
}

fn classify_backend_error(description: &str) -> CaptureError {
    let lowered = description.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") || lowered.contains("access") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::DeviceUnavailable(description.to_string())
    }
}

fn map_build_error(error: cpal::BuildStreamError) -> CaptureError {
    match error {
        cpal::BuildStreamError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable("device no longer available".into())
        }
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend_error(&err.description),
        other => CaptureError::DeviceUnavailable(other.to_string()),
    }
}

async fn enforce_min_duration(started: Instant, min: Duration) {
    let elapsed = started.elapsed();
    if elapsed < min {
        tokio::time::sleep(min - elapsed).await;
    }
}

// ── Recorder ──────────────────────────────────────────────────────

struct ActiveCapture {
    // Held only to keep the device open; dropping it stops the stream.
    _stream: cpal::Stream,
    buffer: Arc<Mutex<RecordingBuffer>>,
    pending: Arc<Mutex<Vec<i16>>>,
    started: Instant,
}

/// Press-and-hold recorder. One instance per session view; the device is
/// held only between `begin_capture` and `end_capture`.
pub struct Recorder {
    config: CaptureConfig,
    format: EncodingFormat,
    active: Option<ActiveCapture>,
}

impl Recorder {
    pub fn new(config: CaptureConfig) -> Self {
        let format = EncodingFormat::negotiate(&[EncodingFormat::Wav, EncodingFormat::Pcm16]);
        tracing::debug!(format = format.mime(), "negotiated capture encoding");
        Self {
            config,
            format,
            active: None,
        }
    }

    pub fn format(&self) -> EncodingFormat {
        self.format
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Acquire the microphone and start chunked buffering.
    pub fn begin_capture(&mut self) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(CaptureError::DeviceNotFound)?;
        let default_config = device
            .default_input_config()
            .map_err(|e| classify_backend_error(&e.to_string()))?;

        // Ask for the target rate first; fall back to whatever the
        // device natively speaks.
        let channels = default_config.channels();
        let desired = StreamConfig {
            channels,
            sample_rate: SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let native: StreamConfig = default_config.clone().into();

        let sample_rate = desired.sample_rate.0;
        let chunk_samples =
            ((u64::from(sample_rate) * self.config.chunk_interval_ms) / 1000).max(1) as usize;

        let buffer = Arc::new(Mutex::new(RecordingBuffer::new(self.format, sample_rate)));
        let pending: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::new()));

        let stream = match Self::build_stream(
            &device,
            &desired,
            default_config.sample_format(),
            chunk_samples,
            Arc::clone(&buffer),
            Arc::clone(&pending),
        ) {
            Ok(stream) => stream,
            Err(_) => {
                // Redo the chunk math at the native rate before retrying.
                let native_rate = native.sample_rate.0;
                let chunk_samples =
                    ((u64::from(native_rate) * self.config.chunk_interval_ms) / 1000).max(1) as usize;
                buffer.lock().sample_rate = native_rate;
                tracing::debug!(
                    target = sample_rate,
                    native = native_rate,
                    "target rate refused, capturing at native rate"
                );
                Self::build_stream(
                    &device,
                    &native,
                    default_config.sample_format(),
                    chunk_samples,
                    Arc::clone(&buffer),
                    Arc::clone(&pending),
                )?
            }
        };

        stream
            .play()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        tracing::info!("recording started");
        self.active = Some(ActiveCapture {
            _stream: stream,
            buffer,
            pending,
            started: Instant::now(),
        });
        Ok(())
    }

    fn build_stream(
        device: &cpal::Device,
        config: &StreamConfig,
        sample_format: cpal::SampleFormat,
        chunk_samples: usize,
        buffer: Arc<Mutex<RecordingBuffer>>,
        pending: Arc<Mutex<Vec<i16>>>,
    ) -> Result<cpal::Stream, CaptureError> {
        let channels = config.channels as usize;
        let err_fn = |e| tracing::error!(error = %e, "input stream error");

        let stream = match sample_format {
            cpal::SampleFormat::F32 => device
                .build_input_stream(
                    config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let samples = fold_mono_f32(data, channels);
                        let mut pending = pending.lock();
                        pending.extend_from_slice(&samples);
                        drain_chunks(&mut pending, chunk_samples, &mut buffer.lock());
                    },
                    err_fn,
                    None,
                )
                .map_err(map_build_error)?,
            cpal::SampleFormat::I16 => device
                .build_input_stream(
                    config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let samples = fold_mono_i16(data, channels);
                        let mut pending = pending.lock();
                        pending.extend_from_slice(&samples);
                        drain_chunks(&mut pending, chunk_samples, &mut buffer.lock());
                    },
                    err_fn,
                    None,
                )
                .map_err(map_build_error)?,
            other => {
                return Err(CaptureError::DeviceUnavailable(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        };
        Ok(stream)
    }

    /// Stop buffering and return the encoded utterance. Gestures shorter
    /// than the minimum keep the device open until the minimum elapses,
    /// so a quick tap still captures a usable payload.
    pub async fn end_capture(&mut self) -> Result<EncodedUtterance, CaptureError> {
        let active = self.active.take().ok_or(CaptureError::EmptyRecording)?;
        enforce_min_duration(
            active.started,
            Duration::from_millis(self.config.min_utterance_ms),
        )
        .await;

        drop(active._stream);

        // Trailing partial chunk still counts toward the payload.
        let tail = std::mem::take(&mut *active.pending.lock());
        let mut buffer = active.buffer.lock();
        buffer.push_chunk(tail);

        let result = buffer.finish(self.config.min_payload_bytes);
        match &result {
            Ok(utterance) => tracing::info!(
                bytes = utterance.raw_bytes,
                format = utterance.format.mime(),
                "utterance captured"
            ),
            Err(e) => tracing::warn!(error = %e, "capture discarded"),
        }
        result
    }

    /// Stop the device and discard the partial buffer.
    pub fn cancel(&mut self) {
        if self.active.take().is_some() {
            tracing::debug!("capture canceled, buffer discarded");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_buffer(samples: usize) -> RecordingBuffer {
        let mut buffer = RecordingBuffer::new(EncodingFormat::Wav, 16_000);
        buffer.push_chunk((0..samples as i16).collect());
        buffer
    }

    #[test]
    fn empty_buffer_is_empty_recording() {
        let mut buffer = RecordingBuffer::new(EncodingFormat::Wav, 16_000);
        assert!(matches!(
            buffer.finish(8000),
            Err(CaptureError::EmptyRecording)
        ));
    }

    #[test]
    fn undersized_payload_is_too_short() {
        let mut buffer = filled_buffer(100);
        match buffer.finish(8000) {
            Err(CaptureError::RecordingTooShort { actual, min }) => {
                assert_eq!(actual, 200);
                assert_eq!(min, 8000);
            }
            other => panic!("expected RecordingTooShort, got {other:?}"),
        }
    }

    #[test]
    fn wav_payload_decodes_back() {
        let mut buffer = RecordingBuffer::new(EncodingFormat::Wav, 16_000);
        buffer.push_chunk(vec![1i16, 2, 3]);
        buffer.push_chunk(vec![4i16, 5, 6]);
        // Drop the size floor so a tiny fixture passes validation.
        let utterance = buffer.finish(0).unwrap();
        assert_eq!(utterance.format, EncodingFormat::Wav);

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&utterance.audio)
            .unwrap();
        assert_eq!(&bytes[..4], b"RIFF");

        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.into_samples().map(Result::unwrap).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn pcm16_payload_is_raw_little_endian() {
        let mut buffer = RecordingBuffer::new(EncodingFormat::Pcm16, 16_000);
        buffer.push_chunk(vec![0x0102i16, -1]);
        let utterance = buffer.finish(0).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&utterance.audio)
            .unwrap();
        assert_eq!(bytes, vec![0x02, 0x01, 0xFF, 0xFF]);
    }

    #[test]
    fn finish_consumes_the_buffer() {
        let mut buffer = filled_buffer(8000);
        buffer.finish(0).unwrap();
        assert!(buffer.is_empty());
        assert!(matches!(buffer.finish(0), Err(CaptureError::EmptyRecording)));
    }

    #[test]
    fn negotiation_prefers_wav() {
        let format = EncodingFormat::negotiate(&[EncodingFormat::Wav, EncodingFormat::Pcm16]);
        assert_eq!(format, EncodingFormat::Wav);
        assert_eq!(format.mime(), "audio/wav");
    }

    #[test]
    fn chunks_cut_at_the_interval() {
        let mut pending: Vec<i16> = (0..700).collect();
        let mut buffer = RecordingBuffer::new(EncodingFormat::Wav, 16_000);
        drain_chunks(&mut pending, 250, &mut buffer);
        assert_eq!(buffer.chunks.len(), 2);
        assert_eq!(buffer.chunks[0].len(), 250);
        assert_eq!(buffer.chunks[1][0], 250);
        assert_eq!(pending.len(), 200);
    }

    #[test]
    fn mono_fold_averages_frames() {
        let stereo = [0.5f32, -0.5, 1.0, 1.0];
        let mono = fold_mono_f32(&stereo, 2);
        assert_eq!(mono, vec![0, i16::MAX]);

        let stereo = [100i16, 300, -50, -50];
        assert_eq!(fold_mono_i16(&stereo, 2), vec![200, -50]);
    }

    #[test]
    fn f32_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
    }

    #[test]
    fn permission_wording_maps_to_permission_denied() {
        assert!(matches!(
            classify_backend_error("Access denied by the operating system"),
            CaptureError::PermissionDenied
        ));
        assert!(matches!(
            classify_backend_error("device is busy"),
            CaptureError::DeviceUnavailable(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn short_gestures_are_stretched_to_the_minimum() {
        let started = Instant::now();
        enforce_min_duration(started, Duration::from_millis(1000)).await;
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn long_gestures_are_not_delayed() {
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        enforce_min_duration(started, Duration::from_millis(1000)).await;
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }
}
