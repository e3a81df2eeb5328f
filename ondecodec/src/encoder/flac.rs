//! FLAC encoder through the libFLAC stream-encoder FFI.
//!
//! The encoder object lives on a blocking task; encoded bytes come back
//! through the write callback into a channel, and an async writer splits
//! them over the sink's frames. Ending a track finalizes the stream; the
//! next track re-initializes the encoder at the renegotiated rate.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ondeaudio::{Heartbeat, Jitter};

use crate::error::{CodecError, Result};
use crate::mime;

use super::{frame_to_i16, pcm_input, EncodedWriter, DEFAULT_RATE};

const CHANNELS: u32 = 2;
const BITS_PER_SAMPLE: u32 = 16;
const COMPRESSION_LEVEL: u32 = 5;
const CHANNEL_CAPACITY: usize = 8;

enum PcmMsg {
    Block { rate: u32, samples: Vec<i16> },
    TrackEnd,
}

enum FlacMsg {
    Bytes { data: Vec<u8>, nsamples: u32 },
    TrackEnd,
}

pub struct FlacEncoder {
    input: Option<Jitter>,
    latency_ms: u32,
    rate: Arc<AtomicU32>,
    tasks: Vec<JoinHandle<()>>,
}

impl FlacEncoder {
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
impl super::Encoder for FlacEncoder {
    fn mime(&self) -> &'static str {
        mime::AUDIO_FLAC
    }

    async fn input_jitter(&mut self) -> Jitter {
        match &self.input {
            Some(input) => input.clone(),
            None => {
                let jitter = pcm_input("flac encoder", self.latency_ms);
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

        let (pcm_tx, pcm_rx) = mpsc::channel::<PcmMsg>(CHANNEL_CAPACITY);
        let (flac_tx, mut flac_rx) = mpsc::channel::<FlacMsg>(CHANNEL_CAPACITY);

        // Pompe : jitter PCM → canal vers la tâche bloquante.
        let pump_input = input.clone();
        let pump_output = output.clone();
        let pump_rate = self.rate.clone();
        let pump = tokio::spawn(async move {
            let mut last_rate = 0u32;
            loop {
                match pump_input.peer().await {
                    Some(peered) => {
                        let rate = match pump_input.frequency() {
                            0 => DEFAULT_RATE,
                            rate => rate,
                        };
                        if rate != last_rate {
                            last_rate = rate;
                            pump_rate.store(rate, Ordering::Release);
                            pump_output.set_frequency(rate);
                            pump_output.set_heartbeat(Heartbeat::samples(rate)).await;
                        }
                        let samples = frame_to_i16(peered.data());
                        let len = peered.len();
                        pump_input.pop(peered, len).await;
                        if pcm_tx.send(PcmMsg::Block { rate, samples }).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        if pump_input.is_closed().await {
                            break;
                        }
                        if pcm_tx.send(PcmMsg::TrackEnd).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.push(pump);

        let encode = tokio::task::spawn_blocking(move || {
            if let Err(err) = run_flac_encoder(pcm_rx, flac_tx) {
                tracing::warn!("flac encoder stopped: {}", err);
            }
        });
        self.tasks.push(encode);

        let writer = tokio::spawn(async move {
            let writer = EncodedWriter::new(output);
            while let Some(msg) = flac_rx.recv().await {
                match msg {
                    FlacMsg::Bytes { data, nsamples } => {
                        if !writer.write(&data, nsamples).await {
                            break;
                        }
                    }
                    FlacMsg::TrackEnd => {
                        writer.track_end().await;
                    }
                }
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

    fn samplerate(&self) -> u32 {
        self.rate.load(Ordering::Acquire)
    }
}

struct ClientState {
    tx: mpsc::Sender<FlacMsg>,
    /// Samples fed since the last callback, attached to the next burst.
    pending_samples: u32,
    error: Option<CodecError>,
}

struct EncoderHandle {
    ptr: *mut libflac_sys::FLAC__StreamEncoder,
}

impl Drop for EncoderHandle {
    fn drop(&mut self) {
        unsafe {
            if !self.ptr.is_null() {
                libflac_sys::FLAC__stream_encoder_delete(self.ptr);
            }
        }
    }
}

fn run_flac_encoder(
    mut rx: mpsc::Receiver<PcmMsg>,
    tx: mpsc::Sender<FlacMsg>,
) -> std::result::Result<(), CodecError> {
    let mut state = ClientState {
        tx,
        pending_samples: 0,
        error: None,
    };
    let mut encoder: Option<(EncoderHandle, u32)> = None;

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            PcmMsg::Block { rate, samples } => {
                if samples.is_empty() {
                    continue;
                }
                if encoder.as_ref().map(|(_, r)| *r) != Some(rate) {
                    if let Some((handle, _)) = encoder.take() {
                        unsafe {
                            libflac_sys::FLAC__stream_encoder_finish(handle.ptr);
                        }
                    }
                    encoder = Some((init_encoder(rate, &mut state)?, rate));
                    tracing::debug!("flac encoder: rate {} Hz", rate);
                }
                let (handle, _) = encoder
                    .as_ref()
                    .ok_or_else(|| CodecError::Init("flac encoder missing".into()))?;
                let wide: Vec<i32> = samples.iter().map(|&s| s as i32).collect();
                let frames = (wide.len() / CHANNELS as usize) as u32;
                state.pending_samples += frames;
                let ok = unsafe {
                    libflac_sys::FLAC__stream_encoder_process_interleaved(
                        handle.ptr,
                        wide.as_ptr(),
                        frames,
                    )
                };
                if ok == 0 {
                    if let Some(err) = state.error.take() {
                        return Err(err);
                    }
                    return Err(CodecError::Encode("libFLAC reported encode failure".into()));
                }
            }
            PcmMsg::TrackEnd => {
                if let Some((handle, _)) = encoder.take() {
                    unsafe {
                        libflac_sys::FLAC__stream_encoder_finish(handle.ptr);
                    }
                }
                if state.tx.blocking_send(FlacMsg::TrackEnd).is_err() {
                    return Ok(());
                }
            }
        }
    }

    if let Some((handle, _)) = encoder.take() {
        unsafe {
            libflac_sys::FLAC__stream_encoder_finish(handle.ptr);
        }
    }
    Ok(())
}

fn init_encoder(
    rate: u32,
    state: &mut ClientState,
) -> std::result::Result<EncoderHandle, CodecError> {
    unsafe {
        let encoder = libflac_sys::FLAC__stream_encoder_new();
        if encoder.is_null() {
            return Err(CodecError::Init(
                "FLAC__stream_encoder_new returned null".into(),
            ));
        }
        let handle = EncoderHandle { ptr: encoder };

        let ensure = |ok: libflac_sys::FLAC__bool, msg: &str| {
            if ok == 0 {
                Err(CodecError::Init(msg.into()))
            } else {
                Ok(())
            }
        };

        ensure(
            libflac_sys::FLAC__stream_encoder_set_channels(encoder, CHANNELS),
            "set_channels failed",
        )?;
        ensure(
            libflac_sys::FLAC__stream_encoder_set_bits_per_sample(encoder, BITS_PER_SAMPLE),
            "set_bits_per_sample failed",
        )?;
        ensure(
            libflac_sys::FLAC__stream_encoder_set_sample_rate(encoder, rate),
            "set_sample_rate failed",
        )?;
        ensure(
            libflac_sys::FLAC__stream_encoder_set_compression_level(encoder, COMPRESSION_LEVEL),
            "set_compression_level failed",
        )?;
        ensure(
            libflac_sys::FLAC__stream_encoder_set_streamable_subset(encoder, 1),
            "set_streamable_subset failed",
        )?;

        let status = libflac_sys::FLAC__stream_encoder_init_stream(
            encoder,
            Some(write_callback),
            None,
            None,
            None,
            state as *mut ClientState as *mut c_void,
        );
        if status != libflac_sys::FLAC__STREAM_ENCODER_INIT_STATUS_OK {
            return Err(CodecError::Init(format!(
                "init_stream failed: status {status}"
            )));
        }
        Ok(handle)
    }
}

unsafe extern "C" fn write_callback(
    _encoder: *const libflac_sys::FLAC__StreamEncoder,
    buffer: *const libflac_sys::FLAC__byte,
    bytes: usize,
    _samples: u32,
    _current_frame: u32,
    client_data: *mut c_void,
) -> libflac_sys::FLAC__StreamEncoderWriteStatus {
    let state = &mut *(client_data as *mut ClientState);
    let slice = std::slice::from_raw_parts(buffer, bytes);
    let msg = FlacMsg::Bytes {
        data: slice.to_vec(),
        nsamples: state.pending_samples,
    };
    state.pending_samples = 0;
    match state.tx.blocking_send(msg) {
        Ok(_) => libflac_sys::FLAC__STREAM_ENCODER_WRITE_STATUS_OK,
        Err(_) => {
            state.error = Some(CodecError::Encode(
                "encoded byte receiver dropped".into(),
            ));
            libflac_sys::FLAC__STREAM_ENCODER_WRITE_STATUS_FATAL_ERROR
        }
    }
}
