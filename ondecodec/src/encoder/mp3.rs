//! MP3 encoder through the LAME binding.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use mp3lame_encoder::{Builder, FlushNoGap, InterleavedPcm};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ondeaudio::{Heartbeat, Jitter};

use crate::error::{CodecError, Result};
use crate::mime;

use super::{frame_to_i16, pcm_input, EncodedWriter, DEFAULT_RATE};

const CHANNEL_CAPACITY: usize = 8;

enum PcmMsg {
    Block { rate: u32, samples: Vec<i16> },
    TrackEnd,
}

enum Mp3Msg {
    Bytes { data: Vec<u8>, nsamples: u32 },
    TrackEnd,
}

pub struct Mp3Encoder {
    input: Option<Jitter>,
    latency_ms: u32,
    rate: Arc<AtomicU32>,
    tasks: Vec<JoinHandle<()>>,
}

impl Mp3Encoder {
    pub fn new(latency_ms: u32) -> Self {
        Self {
            input: None,
            latency_ms,
            rate: Arc::new(AtomicU32::new(DEFAULT_RATE)),
            tasks: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl super::Encoder for Mp3Encoder {
    fn mime(&self) -> &'static str {
        mime::AUDIO_MP3
    }

    async fn input_jitter(&mut self) -> Jitter {
        match &self.input {
            Some(input) => input.clone(),
            None => {
                let jitter = pcm_input("mp3 encoder", self.latency_ms);
                self.input = Some(jitter.clone());
                jitter
            }
        }
    }

    async fn run(&mut self, output: Jitter) -> Result<()> {
        let input = match &self.input {
            Some(input) => input.clone(),
            None => self.input_jitter().await,
        };
        output
            .set_heartbeat(Heartbeat::samples(self.rate.load(Ordering::Acquire)))
            .await;

        let (pcm_tx, pcm_rx) = mpsc::channel::<PcmMsg>(CHANNEL_CAPACITY);
        let (mp3_tx, mut mp3_rx) = mpsc::channel::<Mp3Msg>(CHANNEL_CAPACITY);

        let pump_input = input.clone();
        let pump_output = output.clone();
        let pump_rate = self.rate.clone();
        let pump = tokio::spawn(async move {
            let mut last_rate = 0u32;
            loop {
                match pump_input.peer().await {
                    Some(peered) => {
                        let rate = match pump_input.frequency() {
                            0 => DEFAULT_RATE,
                            rate => rate,
                        };
                        if rate != last_rate {
                            last_rate = rate;
                            pump_rate.store(rate, Ordering::Release);
                            pump_output.set_frequency(rate);
                            pump_output.set_heartbeat(Heartbeat::samples(rate)).await;
                        }
                        let samples = frame_to_i16(peered.data());
                        let len = peered.len();
                        pump_input.pop(peered, len).await;
                        if pcm_tx.send(PcmMsg::Block { rate, samples }).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        if pump_input.is_closed().await {
                            break;
                        }
                        if pcm_tx.send(PcmMsg::TrackEnd).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.push(pump);

        let encode = tokio::task::spawn_blocking(move || {
            if let Err(err) = run_lame(pcm_rx, mp3_tx) {
                tracing::warn!("mp3 encoder stopped: {}", err);
            }
        });
        self.tasks.push(encode);

        let writer = tokio::spawn(async move {
            let writer = EncodedWriter::new(output);
            while let Some(msg) = mp3_rx.recv().await {
                match msg {
                    Mp3Msg::Bytes { data, nsamples } => {
                        if !writer.write(&data, nsamples).await {
                            break;
                        }
                    }
                    Mp3Msg::TrackEnd => {
                        writer.track_end().await;
                    }
                }
            }
        });
        self.tasks.push(writer);
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(input) = &self.input {
            input.close().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    fn samplerate(&self) -> u32 {
        self.rate.load(Ordering::Acquire)
    }
}

fn new_lame(rate: u32) -> std::result::Result<mp3lame_encoder::Encoder, CodecError> {
    let mut builder =
        Builder::new().ok_or_else(|| CodecError::Init("lame_init returned null".into()))?;
    builder
        .set_num_channels(2)
        .map_err(|err| CodecError::Init(err.to_string()))?;
    builder
        .set_sample_rate(rate)
        .map_err(|err| CodecError::Init(err.to_string()))?;
    builder
        .set_brate(mp3lame_encoder::Birtate::Kbps192)
        .map_err(|err| CodecError::Init(err.to_string()))?;
    builder
        .set_quality(mp3lame_encoder::Quality::Good)
        .map_err(|err| CodecError::Init(err.to_string()))?;
    builder
        .build()
        .map_err(|err| CodecError::Init(err.to_string()))
}

fn run_lame(
    mut rx: mpsc::Receiver<PcmMsg>,
    tx: mpsc::Sender<Mp3Msg>,
) -> std::result::Result<(), CodecError> {
    let mut encoder: Option<(mp3lame_encoder::Encoder, u32)> = None;
    let mut out = Vec::new();

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            PcmMsg::Block { rate, samples } => {
                if samples.is_empty() {
                    continue;
                }
                if encoder.as_ref().map(|(_, r)| *r) != Some(rate) {
                    encoder = Some((new_lame(rate)?, rate));
                    tracing::debug!("mp3 encoder: rate {} Hz", rate);
                }
                let (lame, _) = encoder
                    .as_mut()
                    .ok_or_else(|| CodecError::Init("mp3 encoder missing".into()))?;
                let frames = (samples.len() / 2) as u32;
                out.clear();
                lame.encode_to_vec(InterleavedPcm(&samples), &mut out)
                    .map_err(|err| CodecError::Encode(err.to_string()))?;
                if !out.is_empty()
                    && tx
                        .blocking_send(Mp3Msg::Bytes {
                            data: out.clone(),
                            nsamples: frames,
                        })
                        .is_err()
                {
                    return Ok(());
                }
            }
            PcmMsg::TrackEnd => {
                if let Some((mut lame, _)) = encoder.take() {
                    out.clear();
                    if lame.flush_to_vec::<FlushNoGap>(&mut out).is_ok() && !out.is_empty() {
                        let msg = Mp3Msg::Bytes {
                            data: out.clone(),
                            nsamples: 0,
                        };
                        if tx.blocking_send(msg).is_err() {
                            return Ok(());
                        }
                    }
                }
                if tx.blocking_send(Mp3Msg::TrackEnd).is_err() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}
