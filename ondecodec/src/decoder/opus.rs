//! OPUS decoder; consumes one compressed packet per jitter frame.
//!
//! Unlike MP3/FLAC there is no byte-stream parsing: the demuxer delivers
//! packet boundaries, so decoding happens inline on the async task.

use std::sync::Arc;

use tokio::task::JoinHandle;

use ondeaudio::sample::widen;
use ondeaudio::{FilterChain, Jitter, ScatterJitter, SampleFormat};

use crate::common::{JitterProfile, PcmOutput, Telemetry, Transport};
use crate::error::{CodecError, Result};
use crate::mime;

const BASE_FRAMES: usize = 8;
/// One network packet per frame.
const FRAME_SIZE: usize = 1500;
/// Largest OPUS frame at 48 kHz (120 ms).
const MAX_FRAME_SAMPLES: usize = 5760;
/// Consecutive decode failures tolerated before skipping the track.
const MAX_DECODE_ERRORS: u32 = 3;

pub struct OpusDecoder {
    input: Option<Jitter>,
    filter: Option<FilterChain>,
    duration: Option<f64>,
    telemetry: Arc<Telemetry>,
    tasks: Vec<JoinHandle<()>>,
}

impl OpusDecoder {
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

impl Default for OpusDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl super::Decoder for OpusDecoder {
    fn mime(&self) -> &'static str {
        mime::AUDIO_OPUS
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
                let jitter = Jitter::Scatter(
                    ScatterJitter::new("opus decoder", profile.scale(BASE_FRAMES), FRAME_SIZE)
                        .with_format(SampleFormat::Opus),
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
        let mut decoder = opus::Decoder::new(48_000, opus::Channels::Stereo)
            .map_err(|err| CodecError::Init(err.to_string()))?;

        let telemetry = self.telemetry.clone();
        let task = tokio::spawn(async move {
            let mut out = PcmOutput::new(output, filter, transport, telemetry);
            out.configure(48_000, 2);
            let mut pcm = vec![0i16; MAX_FRAME_SAMPLES * 2];
            let mut wide = Vec::new();
            let mut errors = 0u32;
            let mut aborted = false;
            loop {
                let Some(peered) = input.peer().await else {
                    break;
                };
                let decoded = decoder.decode(peered.data(), &mut pcm, false);
                let len = peered.len();
                input.pop(peered, len).await;
                match decoded {
                    Ok(frames) => {
                        errors = 0;
                        wide.clear();
                        wide.extend(pcm[..frames * 2].iter().map(|&s| widen(s as i32, 16)));
                        match out.write(&wide).await {
                            Ok(true) => {}
                            Ok(false) => {
                                aborted = true;
                                break;
                            }
                            Err(err) => {
                                tracing::warn!("opus decoder write failed: {}", err);
                                aborted = true;
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        errors += 1;
                        tracing::warn!("opus packet dropped: {}", err);
                        if errors >= MAX_DECODE_ERRORS {
                            tracing::warn!("opus decode failing, skipping track");
                            input.flush().await;
                            break;
                        }
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

    #[tokio::test]
    async fn test_eos_propagates_without_packets() {
        let mut decoder = OpusDecoder::new();
        let input = decoder.input_jitter(JitterProfile::Low).await;
        let output = Jitter::Scatter(
            ScatterJitter::new("pcm", 4, 4096).with_format(SampleFormat::Pcm16LeStereo),
        );
        decoder
            .run(Arc::new(FreeRun), output.clone())
            .await
            .unwrap();
        input.complete().await;
        assert!(output.peer().await.is_none());
        decoder.shutdown().await;
    }
}
