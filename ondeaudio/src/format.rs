//! Formats d'échantillons transportés par les jitters.
//!
//! Un tag unique encode la profondeur de bits, le nombre de canaux et
//! l'ordre des octets des encodages PCM canoniques, plus les flux
//! compressés qui traversent le pipeline sans être interprétés.

use std::fmt;

/// Tag de format attaché à chaque jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Pcm8Mono,
    Pcm16LeMono,
    Pcm16LeStereo,
    Pcm24In3LeStereo,
    Pcm24In4LeStereo,
    Pcm32LeStereo,
    Pcm32BeStereo,
    Mp3,
    Flac,
    Aac,
    Opus,
    /// Flux opaque : datagrammes RTP, trames conteneur, etc.
    Stream,
}

impl SampleFormat {
    /// Profondeur en bits d'un échantillon PCM, `None` pour les formats
    /// compressés ou opaques.
    pub fn bits_per_sample(&self) -> Option<u8> {
        match self {
            SampleFormat::Pcm8Mono => Some(8),
            SampleFormat::Pcm16LeMono | SampleFormat::Pcm16LeStereo => Some(16),
            SampleFormat::Pcm24In3LeStereo | SampleFormat::Pcm24In4LeStereo => Some(24),
            SampleFormat::Pcm32LeStereo | SampleFormat::Pcm32BeStereo => Some(32),
            _ => None,
        }
    }

    /// Octets occupés par un échantillon d'un seul canal.
    pub fn bytes_per_sample(&self) -> Option<usize> {
        match self {
            SampleFormat::Pcm8Mono => Some(1),
            SampleFormat::Pcm16LeMono | SampleFormat::Pcm16LeStereo => Some(2),
            SampleFormat::Pcm24In3LeStereo => Some(3),
            SampleFormat::Pcm24In4LeStereo => Some(4),
            SampleFormat::Pcm32LeStereo | SampleFormat::Pcm32BeStereo => Some(4),
            _ => None,
        }
    }

    pub fn channels(&self) -> Option<usize> {
        match self {
            SampleFormat::Pcm8Mono | SampleFormat::Pcm16LeMono => Some(1),
            SampleFormat::Pcm16LeStereo
            | SampleFormat::Pcm24In3LeStereo
            | SampleFormat::Pcm24In4LeStereo
            | SampleFormat::Pcm32LeStereo
            | SampleFormat::Pcm32BeStereo => Some(2),
            _ => None,
        }
    }

    /// Octets d'un tuple complet (tous canaux).
    pub fn frame_bytes(&self) -> Option<usize> {
        Some(self.bytes_per_sample()? * self.channels()?)
    }

    pub fn is_pcm(&self) -> bool {
        self.bits_per_sample().is_some()
    }

    pub fn big_endian(&self) -> bool {
        matches!(self, SampleFormat::Pcm32BeStereo)
    }

    /// Le type MIME correspondant, pour la négociation encodeur/mux.
    pub fn mime(&self) -> &'static str {
        match self {
            SampleFormat::Mp3 => "audio/mp3",
            SampleFormat::Flac => "audio/flac",
            SampleFormat::Aac => "audio/aac",
            SampleFormat::Opus => "audio/opus",
            SampleFormat::Stream => "application/octet-stream",
            _ => "audio/pcm",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::Pcm8Mono => "pcm8-mono",
            SampleFormat::Pcm16LeMono => "pcm16le-mono",
            SampleFormat::Pcm16LeStereo => "pcm16le-stereo",
            SampleFormat::Pcm24In3LeStereo => "pcm24in3le-stereo",
            SampleFormat::Pcm24In4LeStereo => "pcm24in4le-stereo",
            SampleFormat::Pcm32LeStereo => "pcm32le-stereo",
            SampleFormat::Pcm32BeStereo => "pcm32be-stereo",
            SampleFormat::Mp3 => "mp3",
            SampleFormat::Flac => "flac",
            SampleFormat::Aac => "aac",
            SampleFormat::Opus => "opus",
            SampleFormat::Stream => "stream",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_layouts() {
        assert_eq!(SampleFormat::Pcm16LeStereo.frame_bytes(), Some(4));
        assert_eq!(SampleFormat::Pcm24In3LeStereo.frame_bytes(), Some(6));
        assert_eq!(SampleFormat::Pcm24In4LeStereo.frame_bytes(), Some(8));
        assert_eq!(SampleFormat::Pcm8Mono.frame_bytes(), Some(1));
    }

    #[test]
    fn test_compressed_has_no_layout() {
        assert!(!SampleFormat::Mp3.is_pcm());
        assert_eq!(SampleFormat::Flac.bits_per_sample(), None);
        assert_eq!(SampleFormat::Stream.frame_bytes(), None);
    }
}
