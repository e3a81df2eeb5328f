//! Encoder adapters: intermediate PCM in, sink wire format out.
//!
//! Encoders mirror the decoder side: they own their PCM input jitter
//! (sized for the configured latency), consume it on a background task,
//! and push encoded frames into the sink's jitter with a samples-based
//! beat so network sinks can pace transmission. The sample rate is
//! renegotiated between tracks by watching the input jitter's frequency.

mod flac;
mod mp3;
mod opus;
mod passthrough;

pub use flac::FlacEncoder;
pub use mp3::Mp3Encoder;
pub use opus::OpusEncoder;
pub use passthrough::PassthroughEncoder;

use ondeaudio::{Beat, Jitter, SampleFormat, ScatterJitter};

use crate::error::{CodecError, Result};
use crate::mime;

/// Rate assumed until the first track negotiates one.
pub(crate) const DEFAULT_RATE: u32 = 44_100;
/// Default end-to-end latency targeted by the PCM frame size.
pub const DEFAULT_LATENCY_MS: u32 = 200;

/// An encoder feeding one sink.
#[async_trait::async_trait]
pub trait Encoder: Send {
    fn mime(&self) -> &'static str;

    /// Lazily creates the PCM input jitter the decoders write into.
    async fn input_jitter(&mut self) -> Jitter;

    /// Starts encoding onto the sink's jitter.
    async fn run(&mut self, output: Jitter) -> Result<()>;

    /// Joins the background task and releases codec state.
    async fn shutdown(&mut self);

    /// Currently negotiated sample rate.
    fn samplerate(&self) -> u32;
}

/// Builds the encoder for a MIME type.
pub fn build(mime_type: &str, latency_ms: u32) -> Result<Box<dyn Encoder>> {
    match mime_type {
        mime::AUDIO_MP3 | mime::AUDIO_MPEG => Ok(Box::new(Mp3Encoder::new(latency_ms))),
        mime::AUDIO_FLAC => Ok(Box::new(FlacEncoder::new(latency_ms))),
        mime::AUDIO_OPUS => Ok(Box::new(OpusEncoder::new(latency_ms))),
        mime::AUDIO_PCM => Ok(Box::new(PassthroughEncoder::new(latency_ms))),
        other => Err(CodecError::UnknownMime(other.to_string())),
    }
}

/// PCM input jitter shared by every encoder: frames sized so one frame
/// holds `latency_ms` of 16-bit stereo at the default rate.
pub(crate) fn pcm_input(name: &str, latency_ms: u32) -> Jitter {
    let bytes = (DEFAULT_RATE as usize * latency_ms as usize / 1000) * 4;
    Jitter::Scatter(
        ScatterJitter::new(name, 3, bytes.max(1024)).with_format(SampleFormat::Pcm16LeStereo),
    )
}

/// Reinterprets an intermediate PCM frame as 16-bit LE samples.
pub(crate) fn frame_to_i16(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(ondeaudio::sample::read_i16_le)
        .collect()
}

/// Splits encoded bytes over the sink's fixed-size frames; the first
/// frame of a burst carries the beat.
pub(crate) struct EncodedWriter {
    out: Jitter,
}

impl EncodedWriter {
    pub fn new(out: Jitter) -> Self {
        Self { out }
    }

    pub fn jitter(&self) -> &Jitter {
        &self.out
    }

    /// Returns `false` when the sink side is tearing down.
    pub async fn write(&self, mut bytes: &[u8], mut nsamples: u32) -> bool {
        while !bytes.is_empty() {
            let Some(mut frame) = self.out.pull().await else {
                return false;
            };
            let n = bytes.len().min(frame.size());
            frame.data_mut()[..n].copy_from_slice(&bytes[..n]);
            let beat = Beat::Samples { nsamples };
            self.out.push(frame, n, Some(beat)).await;
            nsamples = 0;
            bytes = &bytes[n..];
        }
        true
    }

    /// Propagates end of track downstream.
    pub async fn track_end(&self) {
        self.out.complete().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_by_mime() {
        assert!(build(mime::AUDIO_FLAC, DEFAULT_LATENCY_MS).is_ok());
        assert!(build(mime::AUDIO_MP3, DEFAULT_LATENCY_MS).is_ok());
        assert!(build(mime::AUDIO_OPUS, DEFAULT_LATENCY_MS).is_ok());
        assert!(build(mime::AUDIO_PCM, DEFAULT_LATENCY_MS).is_ok());
        assert!(build("video/mp4", DEFAULT_LATENCY_MS).is_err());
    }

    #[test]
    fn test_pcm_input_sizing() {
        let jitter = pcm_input("pcm", 200);
        // 200 ms de stéréo 16 bits à 44,1 kHz.
        assert_eq!(jitter.size(), 44_100 / 5 * 4);
        assert_eq!(jitter.format(), SampleFormat::Pcm16LeStereo);
    }

    #[tokio::test]
    async fn test_encoded_writer_splits_frames() {
        let out = Jitter::Scatter(ScatterJitter::new("sink", 8, 4));
        let writer = EncodedWriter::new(out.clone());
        let data: Vec<u8> = (0..10).collect();
        assert!(writer.write(&data, 100).await);
        let mut collected = Vec::new();
        let mut beats = Vec::new();
        for _ in 0..3 {
            let peered = out.peer_beat().await.unwrap();
            collected.extend_from_slice(peered.data());
            beats.push(peered.beat());
            let len = peered.len();
            out.pop(peered, len).await;
        }
        assert_eq!(collected, data);
        assert_eq!(beats[0], Some(Beat::Samples { nsamples: 100 }));
        assert_eq!(beats[1], Some(Beat::Samples { nsamples: 0 }));
    }
}
