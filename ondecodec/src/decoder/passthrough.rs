//! Pass-through decoder for already-PCM elementary streams.
//!
//! Bytes are reinterpreted as 16-bit little-endian interleaved samples
//! and still traverse the filter chain, so rescale/boost/mono apply
//! uniformly whatever the upstream codec.

use std::sync::Arc;

use tokio::task::JoinHandle;

use ondeaudio::sample::{read_i16_le, widen};
use ondeaudio::{FilterChain, Jitter, RingJitter, SampleFormat};

use crate::common::{JitterProfile, PcmOutput, Telemetry, Transport};
use crate::error::{CodecError, Result};
use crate::mime;

const BASE_FRAMES: usize = 3;
const FRAME_SIZE: usize = 8 * 1024;
/// Assumed rate when the upstream never negotiated one.
const DEFAULT_RATE: u32 = 44_100;
const CHANNELS: usize = 2;

pub struct PassthroughDecoder {
    input: Option<Jitter>,
    filter: Option<FilterChain>,
    duration: Option<f64>,
    telemetry: Arc<Telemetry>,
    tasks: Vec<JoinHandle<()>>,
}

impl PassthroughDecoder {
    pub fn new() -> Self {
        Self {
            input: None,
            filter: None,
            duration: None,
            telemetry: Telemetry::new(),
            tasks: Vec::new(),
        }
    }
}

impl Default for PassthroughDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl super::Decoder for PassthroughDecoder {
    fn mime(&self) -> &'static str {
        mime::AUDIO_PCM
    }

    fn prepare(&mut self, filter: FilterChain, duration_hint: Option<f64>) {
        self.filter = Some(filter);
        self.duration = duration_hint;
        self.telemetry.set_duration(duration_hint);
    }

    async fn input_jitter(&mut self, profile: JitterProfile) -> Jitter {
        match &self.input {
            Some(input) => input.clone(),
            None => {
                let jitter = Jitter::Ring(
                    RingJitter::new("pcm decoder", profile.scale(BASE_FRAMES), FRAME_SIZE)
                        .with_format(SampleFormat::Pcm16LeStereo),
                );
                self.input = Some(jitter.clone());
                jitter
            }
        }
    }

    async fn run(&mut self, transport: Arc<dyn Transport>, output: Jitter) -> Result<()> {
        let input = match &self.input {
            Some(input) => input.clone(),
            None => self.input_jitter(JitterProfile::Low).await,
        };
        let filter = match self.filter.take() {
            Some(filter) => filter,
            None => FilterChain::new(output.format())
                .map_err(|err| CodecError::Init(err.to_string()))?,
        };

        let telemetry = self.telemetry.clone();
        let task = tokio::spawn(async move {
            let mut out = PcmOutput::new(output, filter, transport, telemetry);
            let rate = match input.frequency() {
                0 => DEFAULT_RATE,
                rate => rate,
            };
            out.configure(rate, CHANNELS);
            let tuple_bytes = 2 * CHANNELS;
            let mut wide = Vec::new();
            let mut aborted = false;
            loop {
                let Some(peered) = input.peer().await else {
                    break;
                };
                // Ne consomme que des tuples entiers ; le reliquat reste
                // dans l'anneau pour la lecture suivante.
                let usable = peered.len() - (peered.len() % tuple_bytes);
                wide.clear();
                for tuple in peered.data()[..usable].chunks_exact(2) {
                    wide.push(widen(read_i16_le(tuple) as i32, 16));
                }
                input.pop(peered, usable).await;
                if wide.is_empty() {
                    continue;
                }
                match out.write(&wide).await {
                    Ok(true) => {}
                    Ok(false) => {
                        aborted = true;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!("pcm passthrough write failed: {}", err);
                        aborted = true;
                        break;
                    }
                }
            }
            if !aborted {
                out.finish().await;
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

    fn position_secs(&self) -> f64 {
        self.telemetry.position_secs()
    }

    fn duration_secs(&self) -> Option<f64> {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FreeRun;
    use crate::decoder::Decoder;
    use ondeaudio::ScatterJitter;

    #[tokio::test]
    async fn test_pcm_bytes_cross_the_chain() {
        let mut decoder = PassthroughDecoder::new();
        let input = decoder.input_jitter(JitterProfile::Low).await;
        let output = Jitter::Scatter(
            ScatterJitter::new("pcm out", 4, 16).with_format(SampleFormat::Pcm16LeStereo),
        );
        decoder
            .run(Arc::new(FreeRun), output.clone())
            .await
            .unwrap();
        // Quatre tuples stéréo 16 bits : la trame de sortie (16 octets)
        // se remplit exactement.
        let samples: Vec<i16> = vec![100, -100, 200, -200, 300, -300, 400, -400];
        let mut frame = input.pull().await.unwrap();
        for (i, s) in samples.iter().enumerate() {
            frame.data_mut()[i * 2..i * 2 + 2].copy_from_slice(&s.to_le_bytes());
        }
        input.push(frame, 16, None).await;
        input.complete().await;

        let peered = output.peer().await.unwrap();
        assert_eq!(peered.len(), 16);
        let first = read_i16_le(&peered.data()[..2]);
        assert_eq!(first, 100);
        let len = peered.len();
        output.pop(peered, len).await;
        assert!(output.peer().await.is_none());
        decoder.shutdown().await;
    }
}
