//! Sinks : du jitter d'entrée vers une sortie concrète.
//!
//! Le sink crée son jitter d'entrée dans `jitter()` et le consomme sur
//! une tâche de fond. Les sinks réseau cadencent l'émission sur le
//! battement posé par l'encodeur ; le sink local laisse l'horloge du
//! périphérique dicter le rythme.

mod file;
mod local;
mod udp;
mod unix;

pub use file::FileSink;
pub use local::LocalSink;
pub use udp::UdpSink;
pub use unix::UnixSink;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use ondeaudio::Jitter;
use ondeutils::media_url::{MediaUrl, Scheme};

use crate::error::{Result, StreamError};
use crate::mux::{Mux, PassthroughMux, RtpMux};

/// Volume logiciel partagé entre le player, le plan de contrôle et le
/// sink local (0..100).
#[derive(Clone)]
pub struct Volume(Arc<AtomicU8>);

impl Volume {
    pub fn new(level: u8) -> Self {
        Self(Arc::new(AtomicU8::new(level.min(100))))
    }

    pub fn level(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, level: u8) -> u8 {
        let level = level.min(100);
        self.0.store(level, Ordering::Release);
        level
    }

    /// Ajustement relatif, borné à 0..100.
    pub fn step(&self, delta: i32) -> u8 {
        let level = (self.level() as i32 + delta).clamp(0, 100) as u8;
        self.0.store(level, Ordering::Release);
        level
    }

    /// Gain linéaire appliqué aux échantillons.
    pub fn gain(&self) -> f32 {
        self.level() as f32 / 100.0
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::new(80)
    }
}

/// Un sink en cours d'exploitation.
#[async_trait::async_trait]
pub trait Sink: Send {
    /// Crée (paresseusement) le jitter d'entrée du sink.
    async fn jitter(&mut self) -> Jitter;

    /// Démarre la consommation sur une tâche de fond.
    async fn run(&mut self) -> Result<()>;

    /// Joint les tâches et ferme la sortie.
    async fn shutdown(&mut self);
}

/// Construit le sink correspondant à l'URL.
pub fn build(url: &MediaUrl, volume: Volume) -> Result<Box<dyn Sink>> {
    match url.scheme() {
        Scheme::Alsa => Ok(Box::new(LocalSink::new(url, volume))),
        Scheme::File => Ok(Box::new(FileSink::new(url))),
        Scheme::Udp | Scheme::Rtp => Ok(Box::new(UdpSink::new(url)?)),
        Scheme::Unix => Ok(Box::new(UnixSink::new(url))),
        _ => Err(StreamError::UnsupportedUrl(url.raw().to_string())),
    }
}

/// Chaîne de sortie complète : sink, muxer éventuel, et le jitter dans
/// lequel l'encodeur écrit.
pub struct Output {
    sink: Box<dyn Sink>,
    mux: Box<dyn Mux>,
    input: Jitter,
}

impl Output {
    /// Assemble sink et muxer pour une URL de sortie : RTP est muxé,
    /// tout le reste passe-plat.
    pub async fn build(url: &MediaUrl, encoder_mime: &str, volume: Volume) -> Result<Self> {
        let mut sink = build(url, volume)?;
        let sink_jitter = sink.jitter().await;
        let mut mux: Box<dyn Mux> = match url.scheme() {
            Scheme::Rtp => Box::new(RtpMux::new()),
            _ => Box::new(PassthroughMux::new()),
        };
        mux.run(sink_jitter).await?;
        let input = mux
            .attach(encoder_mime)
            .await
            .ok_or_else(|| StreamError::UnsupportedUrl(url.raw().to_string()))?;
        Ok(Self { sink, mux, input })
    }

    /// Le jitter que l'encodeur alimente.
    pub fn input(&self) -> Jitter {
        self.input.clone()
    }

    pub async fn run(&mut self) -> Result<()> {
        self.sink.run().await
    }

    pub async fn shutdown(&mut self) {
        self.mux.shutdown().await;
        self.sink.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_bounds() {
        let volume = Volume::new(120);
        assert_eq!(volume.level(), 100);
        assert_eq!(volume.step(-30), 70);
        assert_eq!(volume.step(-100), 0);
        assert_eq!(volume.step(7), 7);
        assert_eq!(volume.set(55), 55);
    }

    #[test]
    fn test_build_dispatch() {
        let url = MediaUrl::parse("alsa://default").unwrap();
        assert!(build(&url, Volume::default()).is_ok());
        let url = MediaUrl::parse("file:///tmp/out.pcm").unwrap();
        assert!(build(&url, Volume::default()).is_ok());
        let url = MediaUrl::parse("http://nope/").unwrap();
        assert!(build(&url, Volume::default()).is_err());
    }
}
