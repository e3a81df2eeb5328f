//! Sources : octets bruts depuis une URL vers le jitter aval.
//!
//! Le dispatch se fait sur le schéma de l'URL ; le premier adaptateur
//! dont l'ensemble de protocoles contient le préfixe gagne. Une source
//! qui échoue en lecture marque son jitter `Complete` et émet `EndEs` :
//! le player voit la fin du flux et enchaîne.

mod file;
mod http;
mod udp;
mod unix;

pub use file::FileSource;
pub use http::HttpSource;
pub use udp::UdpSource;
pub use unix::UnixSource;

use ondeaudio::Jitter;
use ondeutils::media_url::{MediaUrl, Scheme};

use crate::demux::DemuxKind;
use crate::error::{Result, StreamError};
use crate::event::EventSender;

/// Une source en cours d'exploitation.
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    /// MIME le mieux connu du i-ème flux élémentaire.
    async fn mime(&self, index: usize) -> Option<String>;

    /// Installe le listener d'événements ; à appeler avant `run`.
    fn set_event_listener(&mut self, tx: EventSender);

    /// Réponse du player à `NewEs` : le jitter d'entrée du décodeur,
    /// ou `None` pour ignorer ce flux.
    async fn attach(&self, pid: u32, input: Option<Jitter>);

    /// Jitter actuellement attaché à un pid.
    async fn estream(&self, pid: u32) -> Option<Jitter>;

    /// Démarre la production sur les tâches de fond.
    async fn run(&mut self) -> Result<()>;

    /// Joint les tâches et ferme la ressource.
    async fn shutdown(&mut self);
}

/// Construit la source correspondant à l'URL.
pub fn build(url: &MediaUrl, mime_hint: Option<&str>) -> Result<Box<dyn Source>> {
    match url.scheme() {
        Scheme::File => Ok(Box::new(FileSource::new(url, mime_hint)?)),
        Scheme::Http | Scheme::Https => Ok(Box::new(HttpSource::new(url, mime_hint))),
        Scheme::Udp => Ok(Box::new(UdpSource::new(url, mime_hint, DemuxKind::Passthrough)?)),
        Scheme::Rtp => Ok(Box::new(UdpSource::new(url, mime_hint, DemuxKind::Rtp)?)),
        Scheme::Unix => Ok(Box::new(UnixSource::new(url, mime_hint))),
        Scheme::Db | Scheme::Alsa => Err(StreamError::UnsupportedUrl(url.raw().to_string())),
    }
}

/// Recopie `data` dans le jitter, trame par trame. Retourne `false`
/// quand le jitter se démonte.
pub(crate) async fn push_bytes(jitter: &Jitter, mut data: &[u8]) -> bool {
    while !data.is_empty() {
        let Some(mut frame) = jitter.pull().await else {
            return false;
        };
        let n = data.len().min(frame.size());
        frame.data_mut()[..n].copy_from_slice(&data[..n]);
        jitter.push(frame, n, None).await;
        data = &data[n..];
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_by_scheme() {
        let url = MediaUrl::parse("http://example.org/radio.mp3").unwrap();
        assert!(build(&url, None).is_ok());
        let url = MediaUrl::parse("udp://239.0.0.1:5004").unwrap();
        assert!(build(&url, None).is_ok());
        let url = MediaUrl::parse("db://var/catalog.db").unwrap();
        assert!(build(&url, None).is_err());
    }

    #[tokio::test]
    async fn test_push_bytes_splits_on_frame_size() {
        let jitter = Jitter::Scatter(ondeaudio::ScatterJitter::new("t", 8, 4));
        assert!(push_bytes(&jitter, &[1, 2, 3, 4, 5, 6]).await);
        let peered = jitter.peer().await.unwrap();
        assert_eq!(peered.data(), &[1, 2, 3, 4]);
        jitter.pop(peered, 4).await;
        let peered = jitter.peer().await.unwrap();
        assert_eq!(peered.data(), &[5, 6]);
        jitter.pop(peered, 2).await;
    }
}
