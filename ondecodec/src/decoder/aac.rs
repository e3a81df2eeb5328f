//! AAC decoder over an ADTS elementary stream, built on fdk-aac.

use std::sync::Arc;

use fdk_aac::dec::{Decoder as AdtsDecoder, Transport as AdtsTransport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ondeaudio::sample::widen;
use ondeaudio::{FilterChain, Jitter, RingJitter, SampleFormat};

use crate::common::{
    spawn_ingest, JitterProfile, PcmOutput, Telemetry, Transport, CHANNEL_CAPACITY,
};
use crate::error::{CodecError, Result};
use crate::mime;

const BASE_FRAMES: usize = 3;
const FRAME_SIZE: usize = 8 * 1024;
/// Worst case: 2048 samples per frame, 8 channels.
const PCM_CAPACITY: usize = 2048 * 8;

struct PcmBlock {
    rate: u32,
    channels: usize,
    samples: Vec<i32>,
}

pub struct AacDecoder {
    input: Option<Jitter>,
    filter: Option<FilterChain>,
    duration: Option<f64>,
    telemetry: Arc<Telemetry>,
    tasks: Vec<JoinHandle<()>>,
}

impl AacDecoder {
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

impl Default for AacDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl super::Decoder for AacDecoder {
    fn mime(&self) -> &'static str {
        mime::AUDIO_AAC
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
                    RingJitter::new("aac decoder", profile.scale(BASE_FRAMES), FRAME_SIZE)
                        .with_format(SampleFormat::Aac),
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
        let decode = tokio::task::spawn_blocking(move || {
            let mut ingest_rx = ingest_rx;
            let mut decoder = AdtsDecoder::new(AdtsTransport::Adts);
            let mut pcm = vec![0i16; PCM_CAPACITY];
            while let Some(chunk) = ingest_rx.blocking_recv() {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = pcm_tx.blocking_send(Err(err));
                        return;
                    }
                };
                let mut data: &[u8] = &bytes;
                while !data.is_empty() {
                    let consumed = match decoder.fill(data) {
                        Ok(consumed) => consumed,
                        Err(err) => {
                            let _ = pcm_tx
                                .blocking_send(Err(CodecError::Decode(err.to_string())));
                            return;
                        }
                    };
                    if consumed == 0 {
                        break;
                    }
                    data = &data[consumed..];
                    // Drain every frame decodable from the filled bits.
                    while decoder.decode_frame(&mut pcm).is_ok() {
                        let info = decoder.stream_info();
                        let channels = (info.numChannels as usize).max(1);
                        let rate = info.sampleRate as u32;
                        let len = decoder.decoded_frame_size().min(pcm.len());
                        let samples = pcm[..len]
                            .iter()
                            .map(|&s| widen(s as i32, 16))
                            .collect::<Vec<_>>();
                        let block = PcmBlock {
                            rate,
                            channels,
                            samples,
                        };
                        if pcm_tx.blocking_send(Ok(block)).is_err() {
                            return;
                        }
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
                                tracing::warn!("aac decoder write failed: {}", err);
                                aborted = true;
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!("aac decode error, skipping track: {}", err);
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
        self.duration
    }
}
