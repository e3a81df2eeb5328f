//! MP3 decoder built on minimp3.
//!
//! The decode loop runs in a blocking task fed through [`ChannelReader`];
//! a leading ID3v2 frame is stripped before the first MP3 frame.

use std::sync::Arc;

use minimp3::{Decoder as MiniMp3Decoder, Error as MiniMp3Error};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ondeaudio::sample::widen;
use ondeaudio::{FilterChain, Jitter, RingJitter, SampleFormat};

use crate::common::{
    spawn_ingest, ChannelReader, JitterProfile, PcmOutput, Telemetry, Transport, CHANNEL_CAPACITY,
};
use crate::error::{CodecError, Result};
use crate::mime;
use crate::tags::Id3Skip;

/// Base number of input frames; scaled up for network streams.
const BASE_FRAMES: usize = 3;
/// Input frame size, sized for roughly 200 ms of compressed stream.
const FRAME_SIZE: usize = 8 * 1024;

struct PcmBlock {
    rate: u32,
    channels: usize,
    samples: Vec<i32>,
}

pub struct Mp3Decoder {
    input: Option<Jitter>,
    filter: Option<FilterChain>,
    duration: Option<f64>,
    telemetry: Arc<Telemetry>,
    tasks: Vec<JoinHandle<()>>,
}

impl Mp3Decoder {
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

impl Default for Mp3Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl super::Decoder for Mp3Decoder {
    fn mime(&self) -> &'static str {
        mime::AUDIO_MP3
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
                    RingJitter::new("mp3 decoder", profile.scale(BASE_FRAMES), FRAME_SIZE)
                        .with_format(SampleFormat::Mp3),
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
            let reader = Id3Skip::new(ChannelReader::new(ingest_rx));
            let mut decoder = MiniMp3Decoder::new(reader);
            loop {
                match decoder.next_frame() {
                    Ok(frame) => {
                        if frame.channels == 0 {
                            let err = CodecError::Decode("frame reported zero channels".into());
                            let _ = pcm_tx.blocking_send(Err(err));
                            return;
                        }
                        let samples = frame
                            .data
                            .iter()
                            .map(|&s| widen(s as i32, 16))
                            .collect::<Vec<_>>();
                        let block = PcmBlock {
                            rate: frame.sample_rate as u32,
                            channels: frame.channels,
                            samples,
                        };
                        if pcm_tx.blocking_send(Ok(block)).is_err() {
                            return;
                        }
                    }
                    Err(MiniMp3Error::Eof) => return,
                    Err(MiniMp3Error::InsufficientData) | Err(MiniMp3Error::SkippedData) => {
                        continue;
                    }
                    Err(MiniMp3Error::Io(err)) => {
                        let _ = pcm_tx.blocking_send(Err(CodecError::Io(err)));
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
                                tracing::warn!("mp3 decoder write failed: {}", err);
                                aborted = true;
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!("mp3 decode error, skipping track: {}", err);
                        // Unblock the source before reporting end of track.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FreeRun;
    use crate::decoder::Decoder;
    use ondeaudio::ScatterJitter;

    #[tokio::test]
    async fn test_input_jitter_is_created_once() {
        let mut decoder = Mp3Decoder::new();
        let first = decoder.input_jitter(JitterProfile::High).await;
        let second = decoder.input_jitter(JitterProfile::Low).await;
        assert_eq!(first.count(), second.count());
        assert_eq!(first.count(), BASE_FRAMES << 2);
    }

    #[tokio::test]
    async fn test_garbage_input_completes_output() {
        let mut decoder = Mp3Decoder::new();
        let input = decoder.input_jitter(JitterProfile::Low).await;
        let output = Jitter::Scatter(
            ScatterJitter::new("pcm", 4, 4096).with_format(SampleFormat::Pcm16LeStereo),
        );
        decoder
            .run(Arc::new(FreeRun), output.clone())
            .await
            .unwrap();
        // Des octets sans trame MP3 valide, puis fin de flux.
        let mut frame = input.pull().await.unwrap();
        frame.data_mut()[..4].copy_from_slice(&[0, 1, 2, 3]);
        input.push(frame, 4, None).await;
        input.complete().await;
        // L'aval observe la fin de flux sans données.
        assert!(output.peer().await.is_none());
        decoder.shutdown().await;
    }
}
