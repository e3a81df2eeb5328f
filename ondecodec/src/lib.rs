//! # OndeCodec
//!
//! Decoder and encoder adapters for the OndePlay pipeline.
//!
//! Decoders turn a compressed elementary stream into filtered PCM; they
//! are selected by MIME type when the source announces a new stream.
//! Encoders turn the intermediate PCM into the wire format the sink
//! expects, renegotiating the sample rate between tracks.
//!
//! Codec libraries that require synchronous `Read` (minimp3, claxon) run
//! in blocking tasks bridged to the async jitters through bounded
//! channels; packet codecs (opus) decode inline on the async task.

mod common;
pub mod decoder;
pub mod encoder;
mod error;
mod tags;

pub use common::{FreeRun, JitterProfile, Telemetry, Transport};
pub use decoder::{build as build_decoder, mime_from_path, Decoder};
pub use encoder::{build as build_encoder, Encoder, DEFAULT_LATENCY_MS};
pub use error::{CodecError, Result};

/// MIME types understood by the adapters.
pub use ondeutils::mime;
