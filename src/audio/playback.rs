//! Sequential playback of synthesized replies.
//!
//! Replies can arrive faster than they can be rendered. [`PlaybackQueue`]
//! is the ordering authority: `enqueue` and `advance` are its only
//! mutators, exactly one segment is in flight at a time, and a failed
//! segment is logged and skipped rather than blocking the rest. The
//! queue is driven by a player task that renders through an
//! [`AudioSink`], so tests can observe ordering without a sound card.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tokio::sync::mpsc;

// ── Queue ─────────────────────────────────────────────────────────

/// One synthesized payload awaiting playback.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    /// Arrival order, assigned at enqueue time.
    pub seq: u64,
    /// Encoded audio as received (WAV container).
    pub data: Vec<u8>,
}

/// Strict-FIFO queue with a single in-flight slot.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    pending: VecDeque<AudioSegment>,
    in_flight: bool,
    next_seq: u64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail. Returns the head segment when the queue was
    /// idle — the caller starts playing it and owes an `advance` later.
    pub fn enqueue(&mut self, data: Vec<u8>) -> Option<AudioSegment> {
        let segment = AudioSegment {
            seq: self.next_seq,
            data,
        };
        self.next_seq += 1;
        self.pending.push_back(segment);

        if self.in_flight {
            return None;
        }
        self.in_flight = true;
        self.pending.pop_front()
    }

    /// Complete the in-flight segment (played or failed) and hand back
    /// the next one, if any. No-op when nothing is in flight.
    pub fn advance(&mut self) -> Option<AudioSegment> {
        if !self.in_flight {
            return None;
        }
        match self.pending.pop_front() {
            Some(next) => Some(next),
            None => {
                self.in_flight = false;
                None
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.in_flight && self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ── Sink seam ─────────────────────────────────────────────────────

/// Renders one segment to completion. Playback failures are reported,
/// logged by the player, and the queue advances past them.
#[async_trait]
pub trait AudioSink: Send {
    async fn play(&mut self, segment: &AudioSegment) -> anyhow::Result<()>;
}

/// Handle for feeding the player task.
#[derive(Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl PlayerHandle {
    /// Queue one reply payload. Ordering follows call order.
    pub async fn enqueue(&self, data: Vec<u8>) {
        if self.tx.send(data).await.is_err() {
            tracing::warn!("player stopped; dropping audio segment");
        }
    }
}

/// Spawn the player task that drives a [`PlaybackQueue`] through `sink`.
pub fn spawn_player<S>(mut sink: S) -> PlayerHandle
where
    S: AudioSink + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        let mut queue = PlaybackQueue::new();
        let mut current: Option<AudioSegment> = None;
        loop {
            match current.take() {
                Some(segment) => {
                    if let Err(e) = sink.play(&segment).await {
                        tracing::warn!(seq = segment.seq, error = %e, "segment playback failed, advancing");
                    }
                    // Pull in whatever arrived while this segment played,
                    // then move to the next head.
                    while let Ok(data) = rx.try_recv() {
                        let _ = queue.enqueue(data);
                    }
                    current = queue.advance();
                }
                None => match rx.recv().await {
                    Some(data) => current = queue.enqueue(data),
                    None => break,
                },
            }
        }
        tracing::debug!("playback queue drained, player stopped");
    });
    PlayerHandle { tx }
}

// ── Device sink ───────────────────────────────────────────────────

/// [`AudioSink`] over the default output device.
#[derive(Default)]
pub struct CpalSink;

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&mut self, segment: &AudioSegment) -> anyhow::Result<()> {
        let (samples, rate) = decode_wav(&segment.data)?;
        // cpal streams are not Send; rendering happens on a blocking
        // thread that owns the stream start to finish.
        tokio::task::spawn_blocking(move || render_samples(samples, rate)).await?
    }
}

/// Decode a WAV payload to mono f32 samples.
fn decode_wav(data: &[u8]) -> anyhow::Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::new(Cursor::new(data))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = f32::from(i16::MAX);
            reader
                .into_samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / scale))
                .collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
    };

    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Linear resample between rates; identity when they already match.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let base = pos.floor() as usize;
            let frac = (pos - pos.floor()) as f32;
            let a = samples[base.min(samples.len() - 1)];
            let b = samples[(base + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Blocking render of one decoded segment through the default output
/// device. Returns when the samples have drained.
fn render_samples(samples: Vec<f32>, rate: u32) -> anyhow::Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no output device available"))?;
    let config: cpal::StreamConfig = device.default_output_config()?.into();

    let out_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    let queue: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(
        resample_linear(&samples, rate, out_rate).into(),
    ));
    let shared = Arc::clone(&queue);

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut queue = shared.lock();
            for frame in data.chunks_mut(channels) {
                let sample = queue.pop_front().unwrap_or(0.0);
                frame.fill(sample);
            }
        },
        |e| tracing::error!(error = %e, "output stream error"),
        None,
    )?;
    stream.play()?;

    while !queue.lock().is_empty() {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    // Let the device drain its last buffer before the stream drops.
    std::thread::sleep(std::time::Duration::from_millis(50));
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────
