//! OPUS encoder; emits one packet per 20 ms frame.
//!
//! OPUS only accepts a fixed set of sample rates and this pipeline never
//! resamples, so tracks at an unsupported rate are dropped with a
//! warning until the next renegotiation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use ondeaudio::{Heartbeat, Jitter};

use crate::error::Result;
use crate::mime;

use super::{frame_to_i16, pcm_input, EncodedWriter};

const SUPPORTED_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];
const DEFAULT_OPUS_RATE: u32 = 48_000;
/// Encoded packets stay comfortably under one network MTU.
const MAX_PACKET: usize = 1400;

pub struct OpusEncoder {
    input: Option<Jitter>,
    latency_ms: u32,
    rate: Arc<AtomicU32>,
    tasks: Vec<JoinHandle<()>>,
}

impl OpusEncoder {
    pub fn new(latency_ms: u32) -> Self {
        Self {
            input: None,
            latency_ms,
            rate: Arc::new(AtomicU32::new(DEFAULT_OPUS_RATE)),
            tasks: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl super::Encoder for OpusEncoder {
    fn mime(&self) -> &'static str {
        mime::AUDIO_OPUS
    }

    async fn input_jitter(&mut self) -> Jitter {
        match &self.input {
            Some(input) => input.clone(),
            None => {
                let jitter = pcm_input("opus encoder", self.latency_ms);
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
        let rate_handle = self.rate.clone();
        output
            .set_heartbeat(Heartbeat::samples(rate_handle.load(Ordering::Acquire)))
            .await;

        let task = tokio::spawn(async move {
            let writer = EncodedWriter::new(output);
            let mut encoder: Option<opus::Encoder> = None;
            let mut rate = 0u32;
            let mut frame_samples = 0usize;
            let mut acc: Vec<i16> = Vec::new();
            let mut packet = vec![0u8; MAX_PACKET];
            loop {
                match input.peer().await {
                    Some(peered) => {
                        let negotiated = match input.frequency() {
                            0 => DEFAULT_OPUS_RATE,
                            negotiated => negotiated,
                        };
                        if negotiated != rate {
                            rate = negotiated;
                            acc.clear();
                            if SUPPORTED_RATES.contains(&rate) {
                                match opus::Encoder::new(
                                    rate,
                                    opus::Channels::Stereo,
                                    opus::Application::Audio,
                                ) {
                                    Ok(enc) => {
                                        encoder = Some(enc);
                                        // Trames de 20 ms.
                                        frame_samples = rate as usize / 50;
                                        rate_handle.store(rate, Ordering::Release);
                                        writer.jitter().set_frequency(rate);
                                        writer
                                            .jitter()
                                            .set_heartbeat(Heartbeat::samples(rate))
                                            .await;
                                        tracing::debug!("opus encoder: rate {} Hz", rate);
                                    }
                                    Err(err) => {
                                        tracing::warn!("opus encoder init failed: {}", err);
                                        encoder = None;
                                    }
                                }
                            } else {
                                tracing::warn!(
                                    "opus encoder: unsupported rate {} Hz, dropping track",
                                    rate
                                );
                                encoder = None;
                            }
                        }
                        let len = peered.len();
                        if encoder.is_some() {
                            acc.extend(frame_to_i16(peered.data()));
                        }
                        input.pop(peered, len).await;

                        let mut delivered = true;
                        if let Some(enc) = encoder.as_mut() {
                            while acc.len() >= frame_samples * 2 {
                                let frame: Vec<i16> = acc.drain(..frame_samples * 2).collect();
                                match enc.encode(&frame, &mut packet) {
                                    Ok(n) => {
                                        if !writer.write(&packet[..n], frame_samples as u32).await
                                        {
                                            delivered = false;
                                            break;
                                        }
                                    }
                                    Err(err) => {
                                        tracing::warn!("opus encode failed: {}", err);
                                    }
                                }
                            }
                        }
                        if !delivered {
                            break;
                        }
                    }
                    None => {
                        if input.is_closed().await {
                            break;
                        }
                        // Fin de piste : le reliquat incomplet est abandonné.
                        acc.clear();
                        writer.track_end().await;
                    }
                }
            }
        });
        self.tasks.push(task);
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
