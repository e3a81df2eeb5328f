//! Shared plumbing between codec adapters.
//!
//! Decoder libraries such as minimp3 and claxon require a synchronous
//! `std::io::Read`, while compressed bytes arrive through the async input
//! jitter. The bridge is a bounded channel drained with `blocking_recv`
//! inside `spawn_blocking`, with an async pump task feeding it from the
//! jitter.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ondeaudio::{Beat, Frame, Jitter};

use crate::error::{CodecError, Result};

/// Chunk size the write loop targets before pushing a PCM frame is set by
/// the output jitter; this is only the channel depth between tasks.
pub(crate) const CHANNEL_CAPACITY: usize = 8;

/// Latency class of a compressed input, selecting the input jitter depth.
/// Network streams ask for deeper buffering than local files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterProfile {
    Low,
    Mid,
    High,
}

impl JitterProfile {
    /// Multiplier applied to the adapter's base frame count.
    pub fn scale(&self, base: usize) -> usize {
        match self {
            JitterProfile::Low => base,
            JitterProfile::Mid => base << 1,
            JitterProfile::High => base << 2,
        }
    }
}

/// The decoder's view of the playback transport: pause gating and
/// end-of-track signalling.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Blocks while playback is paused. Returns `false` when the pipeline
    /// is tearing down and the caller must abort.
    async fn writable(&self) -> bool;

    /// Reports that the current track has been fully decoded.
    fn track_done(&self);
}

/// Transport that never pauses, for tools and tests.
pub struct FreeRun;

#[async_trait::async_trait]
impl Transport for FreeRun {
    async fn writable(&self) -> bool {
        true
    }

    fn track_done(&self) {}
}

/// Playback counters shared between the decode tasks and the handle.
#[derive(Default)]
pub struct Telemetry {
    samples: AtomicU64,
    rate: AtomicU32,
    duration: Mutex<Option<f64>>,
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_rate(&self, rate: u32) {
        self.rate.store(rate, Ordering::Release);
    }

    pub fn add_samples(&self, n: u64) {
        self.samples.fetch_add(n, Ordering::AcqRel);
    }

    pub fn reset(&self) {
        self.samples.store(0, Ordering::Release);
    }

    pub fn set_duration(&self, secs: Option<f64>) {
        if let Ok(mut slot) = self.duration.lock() {
            *slot = secs;
        }
    }

    pub fn position_secs(&self) -> f64 {
        let rate = self.rate.load(Ordering::Acquire);
        if rate == 0 {
            return 0.0;
        }
        self.samples.load(Ordering::Acquire) as f64 / rate as f64
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.duration.lock().ok().and_then(|slot| *slot)
    }
}

/// Sync `Read` over the async ingest channel, driven from
/// `spawn_blocking`.
pub(crate) struct ChannelReader {
    rx: mpsc::Receiver<Result<Bytes>>,
    current: Bytes,
    offset: usize,
    finished: bool,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
            offset: 0,
            finished: false,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.offset < self.current.len() {
                let n = buf.len().min(self.current.len() - self.offset);
                buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            match self.rx.blocking_recv() {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    self.current = bytes;
                    self.offset = 0;
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Err(io::Error::new(io::ErrorKind::Other, err.to_string()));
                }
                None => {
                    self.finished = true;
                    return Ok(0);
                }
            }
        }
    }
}

/// Drains the compressed input jitter into the ingest channel until end
/// of stream.
pub(crate) fn spawn_ingest(input: Jitter, tx: mpsc::Sender<Result<Bytes>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match input.peer().await {
                Some(peered) => {
                    let chunk = Bytes::copy_from_slice(peered.data());
                    let len = peered.len();
                    input.pop(peered, len).await;
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    })
}

/// Writes filtered PCM into the output jitter, one sample tuple at a
/// time, honoring the pause gate before each frame push.
pub(crate) struct PcmOutput {
    jitter: Jitter,
    filter: ondeaudio::FilterChain,
    transport: Arc<dyn Transport>,
    telemetry: Arc<Telemetry>,
    frame: Option<Frame>,
    offset: usize,
    frame_samples: u32,
    channels: usize,
    configured: bool,
}

impl PcmOutput {
    pub fn new(
        jitter: Jitter,
        filter: ondeaudio::FilterChain,
        transport: Arc<dyn Transport>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            jitter,
            filter,
            transport,
            telemetry,
            frame: None,
            offset: 0,
            frame_samples: 0,
            channels: 2,
            configured: false,
        }
    }

    /// Fixes the decoded stream parameters; the first call also seeds the
    /// downstream frequency negotiation.
    pub fn configure(&mut self, rate: u32, channels: usize) {
        if self.configured && rate == self.filter.samplerate() && channels == self.channels {
            return;
        }
        self.filter.configure(rate, channels);
        self.jitter.set_frequency(rate);
        self.telemetry.set_rate(rate);
        self.channels = channels;
        self.configured = true;
        tracing::debug!(
            "pcm output: {} Hz, {} channels into {}",
            rate,
            channels,
            self.jitter.name()
        );
    }

    /// Writes interleaved wide samples. Returns `false` when the pipeline
    /// is tearing down and decoding must stop.
    pub async fn write(&mut self, samples: &[i32]) -> Result<bool> {
        let out_format = self.filter.out_format();
        let bytes = out_format
            .bytes_per_sample()
            .ok_or_else(|| CodecError::Encode(format!("non-PCM output format {out_format}")))?;
        let out_channels = out_format.channels().unwrap_or(self.channels);
        // Une trame ne coupe jamais un tuple : l'entrelacement survit
        // aux frontières de trames.
        let tuple_bytes = bytes * out_channels;
        for tuple in samples.chunks(self.channels.max(1)) {
            if !self.ensure_room(tuple_bytes).await? {
                return Ok(false);
            }
            match self.filter.plan() {
                ondeaudio::ChannelPlan::Direct => {
                    for (channel, &sample) in tuple.iter().enumerate() {
                        let value = self.filter.process(sample, channel);
                        self.emit(value, bytes)?;
                    }
                }
                ondeaudio::ChannelPlan::MonoDown => {
                    let mut mixed = 0;
                    for (channel, &sample) in tuple.iter().enumerate() {
                        mixed = self.filter.process(sample, channel);
                    }
                    // La moyenne occupe chaque canal de sortie restant.
                    for _ in 0..out_channels {
                        self.emit(mixed, bytes)?;
                    }
                }
                ondeaudio::ChannelPlan::Replicate => {
                    let value = self.filter.process(tuple[0], 0);
                    for _ in 0..out_channels {
                        self.emit(value, bytes)?;
                    }
                }
            }
            self.frame_samples += 1;
            self.telemetry.add_samples(1);
        }
        Ok(true)
    }

    /// Garantit qu'une trame est en main avec la place d'un tuple
    /// entier ; pousse la trame pleine au passage.
    async fn ensure_room(&mut self, tuple_bytes: usize) -> Result<bool> {
        if let Some(frame) = &self.frame {
            if self.offset + tuple_bytes > frame.size() && !self.flush_frame().await {
                return Ok(false);
            }
        }
        if self.frame.is_none() {
            match self.jitter.pull().await {
                Some(frame) => {
                    self.frame = Some(frame);
                    self.offset = 0;
                    self.frame_samples = 0;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn emit(&mut self, value: i32, bytes: usize) -> Result<()> {
        let format = self.filter.out_format();
        let frame = self.frame.as_mut().ok_or(CodecError::ChannelClosed)?;
        ondeaudio::sample::write_sample(format, value, &mut frame.data_mut()[self.offset..]);
        self.offset += bytes;
        Ok(())
    }

    async fn flush_frame(&mut self) -> bool {
        let Some(frame) = self.frame.take() else {
            return true;
        };
        if !self.transport.writable().await {
            return false;
        }
        let beat = Beat::Samples {
            nsamples: self.frame_samples,
        };
        self.jitter.push(frame, self.offset, Some(beat)).await;
        self.offset = 0;
        self.frame_samples = 0;
        true
    }

    /// Flushes the last partial frame and marks end of stream so the
    /// downstream stage observes completion.
    pub async fn finish(&mut self) {
        if self.offset > 0 {
            self.flush_frame().await;
        }
        self.frame = None;
        self.jitter.complete().await;
        self.transport.track_done();
    }
}
