//! Muxers : emballent les trames encodées dans un conteneur de
//! transport. Passe-plat pour les sinks locaux, RTP pour le réseau.

pub mod rtp;

pub use rtp::RtpMux;

use ondeaudio::Jitter;

use crate::error::Result;

/// Un muxer entre encodeur et sink.
#[async_trait::async_trait]
pub trait Mux: Send {
    /// MIME du i-ème flux élémentaire attaché.
    fn mime(&self, index: usize) -> Option<String>;

    /// Branche le muxer sur le jitter du sink ; à appeler avant
    /// `attach`.
    async fn run(&mut self, sink_jitter: Jitter) -> Result<()>;

    /// Crée le jitter d'entrée d'un flux élémentaire du MIME donné,
    /// celui dans lequel l'encodeur écrit.
    async fn attach(&mut self, mime: &str) -> Option<Jitter>;

    async fn shutdown(&mut self);
}

/// Passe-plat : l'encodeur écrit directement dans le jitter du sink.
pub struct PassthroughMux {
    out: Option<Jitter>,
    mime: Option<String>,
}

impl PassthroughMux {
    pub fn new() -> Self {
        Self {
            out: None,
            mime: None,
        }
    }
}

impl Default for PassthroughMux {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Mux for PassthroughMux {
    fn mime(&self, index: usize) -> Option<String> {
        (index == 0).then(|| self.mime.clone()).flatten()
    }

    async fn run(&mut self, sink_jitter: Jitter) -> Result<()> {
        self.out = Some(sink_jitter);
        Ok(())
    }

    async fn attach(&mut self, mime: &str) -> Option<Jitter> {
        self.mime = Some(mime.to_string());
        self.out.clone()
    }

    async fn shutdown(&mut self) {}
}
