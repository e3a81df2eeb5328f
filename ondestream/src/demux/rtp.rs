//! Demux RTP : regroupe les paquets par SSRC en flux élémentaires.
//!
//! Les numéros de séquence sont suivis par SSRC ; les trous incrémentent
//! le compteur `missing` (aucune dissimulation de perte n'est tentée),
//! les paquets en retard sont abandonnés. Les entrées CSRC, l'extension
//! et le padding sont honorés.

use std::collections::HashMap;

use ondeaudio::Jitter;
use ondeutils::mime;

use crate::event::{emit, EsLatency, EsRegistry, EventSender, SourceEvent};
use crate::rtp::RtpHeader;
use crate::source::push_bytes;

use super::{DemuxConfig, DemuxStats};

struct EsState {
    jitter: Option<Jitter>,
    expected: Option<u16>,
}

/// Table PT → MIME : profils par défaut plus celui de l'URL.
fn profiles(config: &DemuxConfig) -> Vec<(u8, String)> {
    let mut table = vec![
        (14, mime::AUDIO_MP3.to_string()),
        (11, mime::AUDIO_PCM.to_string()),
        (46, mime::AUDIO_FLAC.to_string()),
    ];
    if let Some((pt, es_mime)) = &config.extra_pt {
        table.push((*pt, es_mime.clone()));
    }
    table
}

fn lookup(table: &[(u8, String)], pt: u8, config: &DemuxConfig) -> String {
    table
        .iter()
        .find(|(entry, _)| *entry == pt)
        .map(|(_, es_mime)| es_mime.clone())
        .or_else(|| config.mime_hint.clone())
        .unwrap_or_else(|| mime::OCTET_STREAM.to_string())
}

/// Boucle du demux RTP.
pub(crate) async fn run(
    input: Jitter,
    listener: Option<EventSender>,
    registry: EsRegistry,
    config: DemuxConfig,
    stats: DemuxStats,
) {
    let table = profiles(&config);
    let mut streams: HashMap<u32, EsState> = HashMap::new();

    loop {
        let Some(peered) = input.peer().await else {
            break;
        };
        let len = peered.len();
        let Some((header, payload)) = RtpHeader::parse(peered.data()) else {
            tracing::warn!("demux: dropping malformed rtp datagram ({} bytes)", len);
            input.pop(peered, len).await;
            continue;
        };
        let ssrc = header.ssrc;

        if !streams.contains_key(&ssrc) {
            let es_mime = lookup(&table, header.payload_type, &config);
            tracing::info!(
                "demux: new rtp substream {} {}({})",
                ssrc,
                es_mime,
                header.payload_type
            );
            emit(
                &listener,
                SourceEvent::NewEs {
                    pid: ssrc,
                    mime: es_mime,
                    latency: EsLatency::High,
                },
            )
            .await;
            let jitter = registry.wait(ssrc).await;
            if jitter.is_some() {
                emit(&listener, SourceEvent::DecodeEs { pid: ssrc }).await;
            } else {
                tracing::warn!("demux: no decoder for substream {}, dropping", ssrc);
            }
            streams.insert(
                ssrc,
                EsState {
                    jitter,
                    expected: None,
                },
            );
        }

        let state = match streams.get_mut(&ssrc) {
            Some(state) => state,
            None => {
                input.pop(peered, len).await;
                continue;
            }
        };
        let Some(out) = state.jitter.clone() else {
            input.pop(peered, len).await;
            continue;
        };

        let mut late = false;
        match state.expected {
            None => state.expected = Some(header.sequence.wrapping_add(1)),
            Some(expected) => {
                let gap = header.sequence.wrapping_sub(expected);
                if gap == 0 {
                    state.expected = Some(header.sequence.wrapping_add(1));
                } else if gap < 0x8000 {
                    stats.add_missing(gap as u64);
                    tracing::warn!(
                        "demux: {} packet(s) missing on substream {} (total {})",
                        gap,
                        ssrc,
                        stats.missing()
                    );
                    state.expected = Some(header.sequence.wrapping_add(1));
                } else {
                    // Paquet en retard : abandonné.
                    late = true;
                }
            }
        }

        if !late {
            let delivered = push_bytes(&out, &peered.data()[payload]).await;
            if !delivered {
                input.pop(peered, len).await;
                break;
            }
        }
        input.pop(peered, len).await;
    }

    for (pid, state) in streams {
        if let Some(jitter) = state.jitter {
            jitter.complete().await;
        }
        emit(&listener, SourceEvent::EndEs { pid }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{input_jitter, DATAGRAM_SIZE};
    use ondeaudio::ScatterJitter;
    use tokio::sync::mpsc;

    fn datagram(seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let header = RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 14,
            sequence: seq,
            timestamp: seq as u32 * 1152,
            ssrc,
        };
        let mut buf = vec![0u8; RtpHeader::LEN + payload.len()];
        header.write(&mut buf);
        buf[RtpHeader::LEN..].copy_from_slice(payload);
        buf
    }

    async fn feed(input: &Jitter, data: &[u8]) {
        let mut frame = input.pull().await.unwrap();
        frame.data_mut()[..data.len()].copy_from_slice(data);
        input.push(frame, data.len(), None).await;
    }

    #[tokio::test]
    async fn test_gap_counts_missing_and_order_is_kept() {
        let input = input_jitter(EsLatency::Low);
        let registry = EsRegistry::new();
        let out = Jitter::Scatter(ScatterJitter::new("dec", 16, DATAGRAM_SIZE));
        let stats = DemuxStats::default();
        let (tx, mut rx) = mpsc::channel(8);

        let task = tokio::spawn(run(
            input.clone(),
            Some(tx),
            registry.clone(),
            DemuxConfig::default(),
            stats.clone(),
        ));

        // Séquences 100, 101, 103, 104 : un paquet manquant.
        for seq in [100u16, 101, 103, 104] {
            feed(&input, &datagram(seq, 0xabcd, &[seq as u8])).await;
        }
        input.complete().await;

        match rx.recv().await {
            Some(SourceEvent::NewEs { pid, mime, .. }) => {
                assert_eq!(pid, 0xabcd);
                assert_eq!(mime, mime::AUDIO_MP3);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        registry.attach(0xabcd, Some(out.clone())).await;
        assert!(matches!(rx.recv().await, Some(SourceEvent::DecodeEs { .. })));

        for seq in [100u16, 101, 103, 104] {
            let peered = out.peer().await.unwrap();
            assert_eq!(peered.data(), &[seq as u8]);
            let len = peered.len();
            out.pop(peered, len).await;
        }
        assert_eq!(stats.missing(), 1);
        assert!(matches!(
            rx.recv().await,
            Some(SourceEvent::EndEs { pid: 0xabcd })
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_packet_is_dropped() {
        let input = input_jitter(EsLatency::Low);
        let registry = EsRegistry::new();
        let out = Jitter::Scatter(ScatterJitter::new("dec", 16, DATAGRAM_SIZE));
        registry.attach(0x42, Some(out.clone())).await;
        let stats = DemuxStats::default();

        let task = tokio::spawn(run(
            input.clone(),
            None,
            registry,
            DemuxConfig::default(),
            stats.clone(),
        ));

        for seq in [10u16, 11, 12, 11, 13] {
            feed(&input, &datagram(seq, 0x42, &[seq as u8])).await;
        }
        input.complete().await;

        // Le 11 rejoué n'apparaît pas dans le flux aval.
        for seq in [10u16, 11, 12, 13] {
            let peered = out.peer().await.unwrap();
            assert_eq!(peered.data(), &[seq as u8]);
            let len = peered.len();
            out.pop(peered, len).await;
        }
        assert!(out.peer().await.is_none());
        assert_eq!(stats.missing(), 0);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_pt_falls_back_to_url_mime() {
        let input = input_jitter(EsLatency::Low);
        let registry = EsRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        let stats = DemuxStats::default();
        let config = DemuxConfig {
            mime_hint: Some(mime::AUDIO_OPUS.to_string()),
            extra_pt: None,
        };

        let task = tokio::spawn(run(input.clone(), Some(tx), registry.clone(), config, stats));

        let mut data = datagram(1, 7, &[0]);
        // PT inconnu 96.
        data[1] = 96;
        feed(&input, &data).await;
        input.complete().await;

        match rx.recv().await {
            Some(SourceEvent::NewEs { mime, .. }) => assert_eq!(mime, mime::AUDIO_OPUS),
            other => panic!("unexpected event: {:?}", other),
        }
        registry.attach(7, None).await;
        while let Some(event) = rx.recv().await {
            if matches!(event, SourceEvent::EndEs { .. }) {
                break;
            }
        }
        task.await.unwrap();
    }
}
