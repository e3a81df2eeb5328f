//! FLAC decoder built on claxon.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ondeaudio::sample::SAMPLE_BITS;
use ondeaudio::{FilterChain, Jitter, RingJitter, SampleFormat};

use crate::common::{
    spawn_ingest, ChannelReader, JitterProfile, PcmOutput, Telemetry, Transport, CHANNEL_CAPACITY,
};
use crate::error::{CodecError, Result};
use crate::mime;

const BASE_FRAMES: usize = 3;
const FRAME_SIZE: usize = 16 * 1024;

struct PcmBlock {
    rate: u32,
    channels: usize,
    samples: Vec<i32>,
}

pub struct FlacDecoder {
    input: Option<Jitter>,
    filter: Option<FilterChain>,
    duration: Option<f64>,
    telemetry: Arc<Telemetry>,
    tasks: Vec<JoinHandle<()>>,
}

impl FlacDecoder {
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

impl Default for FlacDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl super::Decoder for FlacDecoder {
    fn mime(&self) -> &'static str {
        mime::AUDIO_FLAC
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
                    RingJitter::new("flac decoder", profile.scale(BASE_FRAMES), FRAME_SIZE)
                        .with_format(SampleFormat::Flac),
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

        let (ingest_tx, ingest_rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.tasks.push(spawn_ingest(input.clone(), ingest_tx));

        let (pcm_tx, mut pcm_rx) = mpsc::channel::<Result<PcmBlock>>(CHANNEL_CAPACITY);
        let telemetry = self.telemetry.clone();
        let decode = tokio::task::spawn_blocking(move || {
            let reader = ChannelReader::new(ingest_rx);
            let mut flac = match claxon::FlacReader::new(reader) {
                Ok(flac) => flac,
                Err(err) => {
                    let _ = pcm_tx.blocking_send(Err(CodecError::from(err)));
                    return;
                }
            };
            let info = flac.streaminfo();
            if let Some(total) = info.samples {
                telemetry.set_duration(Some(total as f64 / info.sample_rate as f64));
            }
            let bits = info.bits_per_sample as u8;
            let shift = SAMPLE_BITS + 1 - bits.min(SAMPLE_BITS);
            let channels = info.channels as usize;
            let rate = info.sample_rate;

            let mut blocks = flac.blocks();
            let mut buffer = Vec::new();
            loop {
                match blocks.read_next_or_eof(buffer) {
                    Ok(Some(block)) => {
                        let frames = block.duration() as usize;
                        let mut samples = Vec::with_capacity(frames * channels);
                        for i in 0..frames {
                            for ch in 0..channels as u32 {
                                samples.push(block.sample(ch, i as u32) << shift);
                            }
                        }
                        let pcm = PcmBlock {
                            rate,
                            channels,
                            samples,
                        };
                        if pcm_tx.blocking_send(Ok(pcm)).is_err() {
                            return;
                        }
                        buffer = block.into_buffer();
                    }
                    Ok(None) => return,
                    Err(err) => {
                        let _ = pcm_tx.blocking_send(Err(CodecError::from(err)));
                        return;
                    }
                }
            }
        });
        self.tasks.push(decode);

        let telemetry = self.telemetry.clone();
        let writer = tokio::spawn(async move {
            let mut out = PcmOutput::new(output, filter, transport, telemetry);
            let mut aborted = false;
            while let Some(block) = pcm_rx.recv().await {
                match block {
                    Ok(block) => {
                        out.configure(block.rate, block.channels);
                        match out.write(&block.samples).await {
                            Ok(true) => {}
                            Ok(false) => {
                                aborted = true;
                                break;
                            }
                            Err(err) => {
                                tracing::warn!("flac decoder write failed: {}", err);
                                aborted = true;
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!("flac decode error, skipping track: {}", err);
                        input.flush().await;
                        break;
                    }
                }
            }
            if !aborted {
                out.finish().await;
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

    fn position_secs(&self) -> f64 {
        self.telemetry.position_secs()
    }

    fn duration_secs(&self) -> Option<f64> {
        self.telemetry.duration_secs().or(self.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FreeRun;
    use crate::decoder::Decoder;
    use ondeaudio::ScatterJitter;

    #[tokio::test]
    async fn test_invalid_stream_reports_eos_downstream() {
        let mut decoder = FlacDecoder::new();
        let input = decoder.input_jitter(JitterProfile::Low).await;
        let output = Jitter::Scatter(
            ScatterJitter::new("pcm", 4, 4096).with_format(SampleFormat::Pcm16LeStereo),
        );
        decoder
            .run(Arc::new(FreeRun), output.clone())
            .await
            .unwrap();
        let mut frame = input.pull().await.unwrap();
        frame.data_mut()[..8].copy_from_slice(b"notaflac");
        input.push(frame, 8, None).await;
        input.complete().await;
        assert!(output.peer().await.is_none());
        decoder.shutdown().await;
    }
}
