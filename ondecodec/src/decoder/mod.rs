//! Decoder adapters: compressed elementary stream in, filtered PCM out.
//!
//! One decoder runs per elementary stream. The source pushes compressed
//! bytes into the jitter returned by [`Decoder::input_jitter`]; `run`
//! starts the decode tasks against the shared output jitter. The filter
//! chain runs inline inside the decoder's write loop.

mod aac;
mod flac;
mod mp3;
mod opus;
mod passthrough;

pub use aac::AacDecoder;
pub use flac::FlacDecoder;
pub use mp3::Mp3Decoder;
pub use opus::OpusDecoder;
pub use passthrough::PassthroughDecoder;

use std::sync::Arc;

use ondeaudio::{FilterChain, Jitter};

use crate::common::{JitterProfile, Transport};
use crate::error::Result;
use crate::mime;

/// A compressed-stream decoder attached to one elementary stream.
#[async_trait::async_trait]
pub trait Decoder: Send {
    fn mime(&self) -> &'static str;

    /// Assigns the filter chain and an optional duration hint taken from
    /// the media metadata. Must be called before `run`.
    fn prepare(&mut self, filter: FilterChain, duration_hint: Option<f64>);

    /// Lazily creates the compressed-input jitter. The profile deepens
    /// buffering for high-latency (network) streams.
    async fn input_jitter(&mut self, profile: JitterProfile) -> Jitter;

    /// Starts decoding onto `output` on background tasks.
    async fn run(&mut self, transport: Arc<dyn Transport>, output: Jitter) -> Result<()>;

    /// Joins the background tasks and releases codec state.
    async fn shutdown(&mut self);

    /// Seconds of audio decoded so far.
    fn position_secs(&self) -> f64;

    /// Track duration when known from metadata or stream headers.
    fn duration_secs(&self) -> Option<f64>;
}

/// Builds the decoder for a MIME type, or `None` when unsupported.
pub fn build(mime_type: &str) -> Option<Box<dyn Decoder>> {
    match mime_type {
        mime::AUDIO_MP3 | mime::AUDIO_MPEG => Some(Box::new(Mp3Decoder::new())),
        mime::AUDIO_FLAC => Some(Box::new(FlacDecoder::new())),
        mime::AUDIO_AAC => Some(Box::new(AacDecoder::new())),
        mime::AUDIO_OPUS => Some(Box::new(OpusDecoder::new())),
        mime::AUDIO_PCM => Some(Box::new(PassthroughDecoder::new())),
        _ => None,
    }
}

/// Quick extension probe used when inserting media into the catalog.
pub fn mime_from_path(path: &str) -> Option<&'static str> {
    mime::from_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_by_mime() {
        assert!(build(mime::AUDIO_MP3).is_some());
        assert!(build(mime::AUDIO_MPEG).is_some());
        assert!(build(mime::AUDIO_FLAC).is_some());
        assert!(build(mime::AUDIO_OPUS).is_some());
        assert!(build(mime::AUDIO_PCM).is_some());
        assert!(build("video/mp4").is_none());
    }

    #[test]
    fn test_mime_from_path() {
        assert_eq!(mime_from_path("/music/a.MP3"), Some(mime::AUDIO_MP3));
        assert_eq!(mime_from_path("b.flac"), Some(mime::AUDIO_FLAC));
        assert_eq!(mime_from_path("noextension"), None);
    }
}
