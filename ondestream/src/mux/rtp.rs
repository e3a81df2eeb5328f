//! Muxer RTP : une trame encodée par paquet.
//!
//! Numéro de séquence initial, timestamp et SSRC tirés au hasard ;
//! la séquence croît de façon monotone, le marqueur est posé sur le
//! premier paquet et à chaque bouclage de séquence. Le battement de la
//! trame d'entrée est recopié sur la trame de sortie pour que le sink
//! réseau cadence l'émission.

use rand::Rng;
use tokio::task::JoinHandle;

use ondeaudio::{Beat, Jitter, SampleFormat, ScatterJitter};
use ondeutils::mime;

use crate::error::Result;
use crate::rtp::RtpHeader;

use super::Mux;

const ES_FRAMES: usize = 6;
const ES_THRESHOLD: usize = 3;

/// PT statique par MIME, `99` pour les formats dynamiques.
fn payload_type(es_mime: &str) -> u8 {
    match mime::canonical(es_mime) {
        mime::AUDIO_MP3 => 14,
        mime::AUDIO_PCM => 11,
        mime::AUDIO_FLAC => 46,
        _ => 99,
    }
}

fn es_format(es_mime: &str) -> SampleFormat {
    match mime::canonical(es_mime) {
        mime::AUDIO_MP3 => SampleFormat::Mp3,
        mime::AUDIO_PCM => SampleFormat::Pcm16LeStereo,
        mime::AUDIO_FLAC => SampleFormat::Flac,
        mime::AUDIO_OPUS => SampleFormat::Opus,
        _ => SampleFormat::Stream,
    }
}

pub struct RtpMux {
    out: Option<Jitter>,
    estreams: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl RtpMux {
    pub fn new() -> Self {
        Self {
            out: None,
            estreams: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

impl Default for RtpMux {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Mux for RtpMux {
    fn mime(&self, index: usize) -> Option<String> {
        self.estreams.get(index).cloned()
    }

    async fn run(&mut self, sink_jitter: Jitter) -> Result<()> {
        self.out = Some(sink_jitter);
        Ok(())
    }

    async fn attach(&mut self, es_mime: &str) -> Option<Jitter> {
        let out = self.out.clone()?;
        let payload_size = out.size().saturating_sub(RtpHeader::LEN).max(1);
        let input = Jitter::Scatter(
            ScatterJitter::new("rtp muxer", ES_FRAMES, payload_size)
                .with_threshold(ES_THRESHOLD)
                .with_format(es_format(es_mime)),
        );
        self.estreams.push(es_mime.to_string());

        let pt = payload_type(es_mime);
        let mut rng = rand::rng();
        let mut header = RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: true,
            payload_type: pt,
            sequence: rng.random(),
            timestamp: rng.random(),
            ssrc: rng.random(),
        };

        let es_input = input.clone();
        let task = tokio::spawn(async move {
            loop {
                match es_input.peer_beat().await {
                    Some(peered) => {
                        let Some(mut frame) = out.pull().await else {
                            let len = peered.len();
                            es_input.pop(peered, len).await;
                            break;
                        };
                        let mut offset = header.write(frame.data_mut());
                        let payload = peered.data();
                        let n = payload.len().min(frame.size() - offset);
                        frame.data_mut()[offset..offset + n].copy_from_slice(&payload[..n]);
                        offset += n;
                        let beat = peered.beat();
                        out.push(frame, offset, beat).await;

                        header.marker = false;
                        header.sequence = header.sequence.wrapping_add(1);
                        if header.sequence == 0 {
                            header.marker = true;
                        }
                        if let Some(Beat::Samples { nsamples }) = beat {
                            header.timestamp = header.timestamp.wrapping_add(nsamples);
                        }
                        let len = peered.len();
                        es_input.pop(peered, len).await;
                    }
                    None => {
                        if es_input.is_closed().await {
                            break;
                        }
                        // Fin de piste : propagée au sink.
                        out.complete().await;
                    }
                }
            }
        });
        self.tasks.push(task);
        Some(input)
    }

    async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}
