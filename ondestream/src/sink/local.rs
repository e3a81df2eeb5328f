//! Sink carte son locale via cpal.
//!
//! Une tâche async draine le jitter d'entrée vers un tampon partagé ;
//! un thread dédié possède le flux cpal (il n'est pas `Send`) et le
//! rappel temps réel y puise. Quand le tampon est vide alors que le
//! flux tourne, le rappel émet un bruit de très bas niveau plutôt que
//! du silence : une source réseau lente ne fait pas décrocher le
//! périphérique. Le volume logiciel s'applique ici, échantillon par
//! échantillon.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ondeaudio::sample::read_i16_le;
use ondeaudio::{Jitter, SampleFormat, ScatterJitter};
use ondeutils::media_url::MediaUrl;

use crate::error::{Result, StreamError};

use super::Volume;

const FRAMES: usize = 4;
const THRESHOLD: usize = 2;
/// ~100 ms de stéréo 16 bits à 44,1 kHz par trame.
const FRAME_BYTES: usize = 17_640;
/// Au-delà, la tâche d'alimentation attend que le rappel consomme.
const HIGH_WATER_SAMPLES: usize = 48_000;
/// Amplitude du bruit d'entretien, inaudible en pratique.
const NOISE_AMPLITUDE: f32 = 0.0005;

struct SharedBuffer {
    /// Échantillons stéréo entrelacés, déjà au gain du volume.
    samples: VecDeque<f32>,
    /// Générateur xorshift pour le bruit d'entretien.
    noise: u32,
}

impl SharedBuffer {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            noise: 0x1234_5678,
        }
    }

    fn next_sample(&mut self) -> f32 {
        match self.samples.pop_front() {
            Some(sample) => sample,
            None => {
                self.noise ^= self.noise << 13;
                self.noise ^= self.noise >> 17;
                self.noise ^= self.noise << 5;
                (self.noise as f32 / u32::MAX as f32 - 0.5) * 2.0 * NOISE_AMPLITUDE
            }
        }
    }
}

enum StreamCmd {
    /// (Re)construit le flux à la fréquence donnée.
    Rebuild(u32),
    Shutdown,
}

pub struct LocalSink {
    device: String,
    volume: Volume,
    input: Option<Jitter>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    audio_thread: Option<(std_mpsc::Sender<StreamCmd>, thread::JoinHandle<()>)>,
}

impl LocalSink {
    pub fn new(url: &MediaUrl, volume: Volume) -> Self {
        let device = match url.path() {
            "" => "default".to_string(),
            path => path.to_string(),
        };
        Self {
            device,
            volume,
            input: None,
            stop: CancellationToken::new(),
            tasks: Vec::new(),
            audio_thread: None,
        }
    }
}

#[async_trait::async_trait]
impl super::Sink for LocalSink {
    async fn jitter(&mut self) -> Jitter {
        match &self.input {
            Some(input) => input.clone(),
            None => {
                let jitter = Jitter::Scatter(
                    ScatterJitter::new("local sink", FRAMES, FRAME_BYTES)
                        .with_threshold(THRESHOLD)
                        .with_format(SampleFormat::Pcm16LeStereo),
                );
                self.input = Some(jitter.clone());
                jitter
            }
        }
    }

    async fn run(&mut self) -> Result<()> {
        let input = match &self.input {
            Some(input) => input.clone(),
            None => self.jitter().await,
        };
        let shared = Arc::new(Mutex::new(SharedBuffer::new()));
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<StreamCmd>();
        let device_name = self.device.clone();
        let callback_shared = shared.clone();

        // Thread dédié : le Stream cpal n'est pas Send.
        let audio = thread::Builder::new()
            .name("local-sink".into())
            .spawn(move || audio_thread(device_name, cmd_rx, callback_shared))
            .map_err(|err| StreamError::Device(err.to_string()))?;
        self.audio_thread = Some((cmd_tx.clone(), audio));

        let volume = self.volume.clone();
        let stop = self.stop.clone();
        let feeder = tokio::spawn(async move {
            let mut rate = 0u32;
            loop {
                let peered = tokio::select! {
                    _ = stop.cancelled() => break,
                    peered = input.peer_beat() => peered,
                };
                match peered {
                    Some(peered) => {
                        let negotiated = match input.frequency() {
                            0 => 44_100,
                            negotiated => negotiated,
                        };
                        if negotiated != rate {
                            rate = negotiated;
                            if cmd_tx.send(StreamCmd::Rebuild(rate)).is_err() {
                                break;
                            }
                        }
                        let gain = volume.gain();
                        {
                            let mut buf = match shared.lock() {
                                Ok(buf) => buf,
                                Err(_) => break,
                            };
                            for pair in peered.data().chunks_exact(2) {
                                let sample = read_i16_le(pair) as f32 / 32_768.0;
                                buf.samples.push_back(sample * gain);
                            }
                        }
                        let len = peered.len();
                        input.pop(peered, len).await;
                        // Contre-pression : laisse le rappel consommer.
                        loop {
                            let pending = match shared.lock() {
                                Ok(buf) => buf.samples.len(),
                                Err(_) => 0,
                            };
                            if pending <= HIGH_WATER_SAMPLES || stop.is_cancelled() {
                                break;
                            }
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                    None => {
                        if input.is_closed().await {
                            break;
                        }
                        tracing::debug!("local sink: end of track");
                    }
                }
            }
        });
        self.tasks.push(feeder);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(input) = &self.input {
            input.close().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some((cmd_tx, handle)) = self.audio_thread.take() {
            let _ = cmd_tx.send(StreamCmd::Shutdown);
            let _ = tokio::task::spawn_blocking(move || {
                let _ = handle.join();
            })
            .await;
        }
    }
}

/// Possède le flux cpal et le reconstruit à chaque renégociation de
/// fréquence.
fn audio_thread(
    device_name: String,
    cmd_rx: std_mpsc::Receiver<StreamCmd>,
    shared: Arc<Mutex<SharedBuffer>>,
) {
    let host = cpal::default_host();
    let device = match find_device(&host, &device_name) {
        Some(device) => device,
        None => {
            tracing::error!("no output device matching {}", device_name);
            return;
        }
    };
    let mut stream: Option<cpal::Stream> = None;

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            StreamCmd::Shutdown => break,
            StreamCmd::Rebuild(rate) => {
                drop(stream.take());
                match build_stream(&device, rate, shared.clone()) {
                    Ok(new_stream) => {
                        if let Err(err) = new_stream.play() {
                            tracing::error!("audio stream start failed: {}", err);
                        } else {
                            tracing::info!("local sink: playing at {} Hz", rate);
                            stream = Some(new_stream);
                        }
                    }
                    Err(err) => {
                        tracing::error!("audio stream build failed: {}", err);
                    }
                }
            }
        }
    }
    drop(stream);
}

fn find_device(host: &cpal::Host, name: &str) -> Option<cpal::Device> {
    if name == "default" {
        return host.default_output_device();
    }
    let devices = host.output_devices().ok()?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Some(device);
        }
    }
    tracing::warn!("device {} not found, falling back to default", name);
    host.default_output_device()
}

fn build_stream(
    device: &cpal::Device,
    rate: u32,
    shared: Arc<Mutex<SharedBuffer>>,
) -> std::result::Result<cpal::Stream, StreamError> {
    let default = device
        .default_output_config()
        .map_err(|err| StreamError::Device(err.to_string()))?;
    let channels = default.channels().max(1) as usize;
    let config = cpal::StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let err_fn = |err| tracing::error!("audio stream error: {}", err);

    let stream = match default.sample_format() {
        cpal::SampleFormat::I16 => device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut buf = match shared.lock() {
                        Ok(buf) => buf,
                        Err(_) => return,
                    };
                    for frame in data.chunks_mut(channels) {
                        let left = buf.next_sample();
                        let right = buf.next_sample();
                        write_frame_i16(frame, left, right);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|err| StreamError::Device(err.to_string()))?,
        _ => device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buf = match shared.lock() {
                        Ok(buf) => buf,
                        Err(_) => return,
                    };
                    for frame in data.chunks_mut(channels) {
                        let left = buf.next_sample();
                        let right = buf.next_sample();
                        write_frame_f32(frame, left, right);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|err| StreamError::Device(err.to_string()))?,
    };
    Ok(stream)
}

fn write_frame_i16(frame: &mut [i16], left: f32, right: f32) {
    for (channel, slot) in frame.iter_mut().enumerate() {
        let value = if channel == 0 { left } else { right };
        *slot = (value * 32_767.0).clamp(-32_768.0, 32_767.0) as i16;
    }
}

fn write_frame_f32(frame: &mut [f32], left: f32, right: f32) {
    for (channel, slot) in frame.iter_mut().enumerate() {
        let value = if channel == 0 { left } else { right };
        *slot = value.clamp(-1.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_keepalive_is_low_level() {
        let mut shared = SharedBuffer::new();
        for _ in 0..1000 {
            let sample = shared.next_sample();
            assert!(sample.abs() <= NOISE_AMPLITUDE);
        }
    }

    #[test]
    fn test_buffered_samples_come_first() {
        let mut shared = SharedBuffer::new();
        shared.samples.push_back(0.5);
        shared.samples.push_back(-0.5);
        assert_eq!(shared.next_sample(), 0.5);
        assert_eq!(shared.next_sample(), -0.5);
        // Tampon vide : le bruit d'entretien prend le relais.
        assert!(shared.next_sample().abs() <= NOISE_AMPLITUDE);
    }
}
