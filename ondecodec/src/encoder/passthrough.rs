//! Pass-through encoder: hands the intermediate PCM to the sink as-is.
//!
//! Default choice when the sink plays local PCM; still attaches the
//! samples beat so a network sink downstream can pace itself.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use ondeaudio::{Heartbeat, Jitter};

use crate::error::Result;
use crate::mime;

use super::{pcm_input, EncodedWriter, DEFAULT_RATE};

pub struct PassthroughEncoder {
    input: Option<Jitter>,
    latency_ms: u32,
    rate: Arc<AtomicU32>,
    tasks: Vec<JoinHandle<()>>,
}

impl PassthroughEncoder {
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
impl super::Encoder for PassthroughEncoder {
    fn mime(&self) -> &'static str {
        mime::AUDIO_PCM
    }

    async fn input_jitter(&mut self) -> Jitter {
        match &self.input {
            Some(input) => input.clone(),
            None => {
                let jitter = pcm_input("pcm encoder", self.latency_ms);
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
            let mut rate = 0u32;
            loop {
                match input.peer().await {
                    Some(peered) => {
                        let negotiated = input.frequency();
                        if negotiated != 0 && negotiated != rate {
                            rate = negotiated;
                            rate_handle.store(rate, Ordering::Release);
                            writer.jitter().set_frequency(rate);
                            writer.jitter().set_heartbeat(Heartbeat::samples(rate)).await;
                            tracing::debug!("pcm encoder: rate {} Hz", rate);
                        }
                        let nsamples = (peered.len() / 4) as u32;
                        let delivered = writer.write(peered.data(), nsamples).await;
                        let len = peered.len();
                        input.pop(peered, len).await;
                        if !delivered {
                            break;
                        }
                    }
                    None => {
                        if input.is_closed().await {
                            break;
                        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Encoder;
    use ondeaudio::{SampleFormat, ScatterJitter};

    #[tokio::test]
    async fn test_pcm_crosses_and_eos_propagates() {
        let mut encoder = PassthroughEncoder::new(200);
        let input = encoder.input_jitter().await;
        let output = Jitter::Scatter(
            ScatterJitter::new("sink", 8, 65_536).with_format(SampleFormat::Pcm16LeStereo),
        );
        encoder.run(output.clone()).await.unwrap();

        input.set_frequency(48_000);
        let mut frame = input.pull().await.unwrap();
        frame.data_mut()[..8].copy_from_slice(&[1, 0, 2, 0, 3, 0, 4, 0]);
        input.push(frame, 8, None).await;

        let peered = output.peer_beat().await.unwrap();
        assert_eq!(peered.data(), &[1, 0, 2, 0, 3, 0, 4, 0]);
        let len = peered.len();
        output.pop(peered, len).await;
        // La fréquence négociée s'est propagée au jitter de sortie.
        assert_eq!(output.frequency(), 48_000);
        assert_eq!(encoder.samplerate(), 48_000);

        input.complete().await;
        assert!(output.peer_beat().await.is_none());
        encoder.shutdown().await;
    }
}
