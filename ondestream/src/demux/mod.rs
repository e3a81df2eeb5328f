//! Démultiplexage : du flux de datagrammes aux flux élémentaires.
//!
//! Une source réseau embarque un demux : passe-plat pour les flux nus
//! (`udp://`), analyse RTP pour `rtp://`. Le demux publie `NewEs` à la
//! première apparition d'un flux élémentaire pour que le player attache
//! les décodeurs paresseusement.

pub(crate) mod rtp;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ondeaudio::{Jitter, SampleFormat, ScatterJitter};
use ondeutils::mime;

use crate::event::{emit, EsLatency, EsRegistry, EventSender, SourceEvent};
use crate::source::push_bytes;

/// Taille d'un datagramme : jamais plus qu'un MTU Ethernet.
pub(crate) const DATAGRAM_SIZE: usize = 1500;
const BASE_FRAMES: usize = 8;

/// Variante de demux embarquée par une source réseau.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxKind {
    Passthrough,
    Rtp,
}

/// Paramètres issus de l'URL.
#[derive(Debug, Clone, Default)]
pub(crate) struct DemuxConfig {
    pub mime_hint: Option<String>,
    /// Profil supplémentaire `?pt=N` ajouté à la table par défaut.
    pub extra_pt: Option<(u8, String)>,
}

/// Compteurs du demux, partagés avec la source pour la télémétrie.
#[derive(Debug, Clone, Default)]
pub struct DemuxStats {
    missing: Arc<AtomicU64>,
}

impl DemuxStats {
    pub fn missing(&self) -> u64 {
        self.missing.load(Ordering::Acquire)
    }

    pub(crate) fn add_missing(&self, n: u64) {
        self.missing.fetch_add(n, Ordering::AcqRel);
    }
}

/// Jitter d'entrée du demux ; la source y pousse un datagramme par
/// trame. Le seuil aux trois quarts absorbe la gigue réseau.
pub(crate) fn input_jitter(latency: EsLatency) -> Jitter {
    let count = match latency {
        EsLatency::Low => BASE_FRAMES,
        EsLatency::Mid => BASE_FRAMES << 1,
        EsLatency::High => BASE_FRAMES << 2,
    };
    Jitter::Scatter(
        ScatterJitter::new("demux", count, DATAGRAM_SIZE)
            .with_threshold(count * 3 / 4)
            .with_format(SampleFormat::Stream),
    )
}

/// Boucle du demux passe-plat : un seul flux élémentaire, les octets
/// traversent tels quels.
pub(crate) async fn run_passthrough(
    input: Jitter,
    listener: Option<EventSender>,
    registry: EsRegistry,
    config: DemuxConfig,
) {
    let es_mime = config
        .mime_hint
        .unwrap_or_else(|| mime::OCTET_STREAM.to_string());
    emit(
        &listener,
        SourceEvent::NewEs {
            pid: 0,
            mime: es_mime,
            latency: EsLatency::High,
        },
    )
    .await;
    let Some(out) = registry.wait(0).await else {
        tracing::warn!("demux: no decoder, dropping stream");
        emit(&listener, SourceEvent::EndEs { pid: 0 }).await;
        return;
    };
    emit(&listener, SourceEvent::DecodeEs { pid: 0 }).await;
    loop {
        let Some(peered) = input.peer().await else {
            break;
        };
        let delivered = push_bytes(&out, peered.data()).await;
        let len = peered.len();
        input.pop(peered, len).await;
        if !delivered {
            break;
        }
    }
    out.complete().await;
    emit(&listener, SourceEvent::EndEs { pid: 0 }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_passthrough_single_es_lifecycle() {
        let input = input_jitter(EsLatency::Low);
        let (tx, mut rx) = mpsc::channel(8);
        let registry = EsRegistry::new();
        let out = Jitter::Scatter(ScatterJitter::new("dec", 8, DATAGRAM_SIZE));
        registry.attach(0, Some(out.clone())).await;

        let config = DemuxConfig {
            mime_hint: Some(mime::AUDIO_MP3.to_string()),
            extra_pt: None,
        };
        let task = tokio::spawn(run_passthrough(
            input.clone(),
            Some(tx),
            registry,
            config,
        ));

        match rx.recv().await {
            Some(SourceEvent::NewEs { pid, mime, .. }) => {
                assert_eq!(pid, 0);
                assert_eq!(mime, mime::AUDIO_MP3);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(SourceEvent::DecodeEs { .. })));

        // Le seuil du jitter d'entrée est 6 trames : on les fournit puis
        // on clôt.
        for i in 0..6u8 {
            let mut frame = input.pull().await.unwrap();
            frame.data_mut()[0] = i;
            input.push(frame, 1, None).await;
        }
        input.complete().await;

        for i in 0..6u8 {
            let peered = out.peer().await.unwrap();
            assert_eq!(peered.data(), &[i]);
            input_pop(&out, peered).await;
        }
        assert!(out.peer().await.is_none());
        assert!(matches!(rx.recv().await, Some(SourceEvent::EndEs { .. })));
        task.await.unwrap();
    }

    async fn input_pop(jitter: &Jitter, peered: ondeaudio::Peered) {
        let len = peered.len();
        jitter.pop(peered, len).await;
    }
}
