//! Chaîne de filtres appliquée échantillon par échantillon.
//!
//! Transformations sans état partagé, dans un ordre fixe : requantification
//! (réduction de profondeur), boost/replay-gain, mixage mono, statistiques.
//! La chaîne est invoquée par la boucle d'écriture du décodeur ; elle ne
//! possède pas de jitter propre.

mod boost;
mod mix;
mod rescale;
mod stats;

pub use boost::Boost;
pub use mix::MonoMix;
pub use rescale::Rescale;
pub use stats::Stats;

use crate::error::{AudioError, Result};
use crate::sample::SAMPLE_BITS;
use crate::SampleFormat;

/// Adaptation de canaux décidée à la configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPlan {
    /// Autant de canaux en entrée qu'en sortie.
    Direct,
    /// Plus de canaux en entrée : moyenne vers mono.
    MonoDown,
    /// Moins de canaux en entrée : réplication.
    Replicate,
}

/// Chaîne de filtres d'une piste.
pub struct FilterChain {
    out_format: SampleFormat,
    out_bits: u8,
    in_bits: u8,
    samplerate: u32,
    plan: ChannelPlan,
    rescale: Rescale,
    boost: Option<Boost>,
    mono: Option<MonoMix>,
    stats: Option<Stats>,
}

impl FilterChain {
    /// Construit la chaîne pour un format de sortie PCM donné.
    pub fn new(out_format: SampleFormat) -> Result<Self> {
        let out_bits = out_format
            .bits_per_sample()
            .ok_or(AudioError::NotPcm(out_format))?;
        Ok(Self {
            out_format,
            out_bits,
            in_bits: SAMPLE_BITS,
            samplerate: 0,
            plan: ChannelPlan::Direct,
            rescale: Rescale::new(out_bits),
            boost: None,
            mono: None,
            stats: None,
        })
    }

    /// Gain de piste en décibels, typiquement issu du replay-gain des
    /// métadonnées.
    pub fn with_replaygain(mut self, db: f32) -> Self {
        if db != 0.0 {
            self.boost = Some(Boost::new(db));
        }
        self
    }

    /// Active l'accumulation de statistiques (usage diagnostic).
    pub fn with_stats(mut self) -> Self {
        self.stats = Some(Stats::new());
        self
    }

    /// Fixe la fréquence et le nombre de canaux du flux décodé ; appelée
    /// à la première trame, quand le décodeur connaît le format réel.
    pub fn configure(&mut self, samplerate: u32, in_channels: usize) {
        self.samplerate = samplerate;
        let out_channels = self.out_format.channels().unwrap_or(in_channels);
        self.plan = if in_channels > out_channels {
            self.mono = Some(MonoMix::new(in_channels));
            ChannelPlan::MonoDown
        } else if in_channels < out_channels {
            ChannelPlan::Replicate
        } else {
            ChannelPlan::Direct
        };
    }

    pub fn plan(&self) -> ChannelPlan {
        self.plan
    }

    pub fn out_format(&self) -> SampleFormat {
        self.out_format
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    /// Passe un échantillon dans la chaîne. `sample` est cadré sur la
    /// magnitude interne ; le résultat est quantifié à la profondeur du
    /// format de sortie.
    pub fn process(&mut self, sample: i32, channel: usize) -> i32 {
        if sample == i32::MIN {
            // Sentinelle de vidage des statistiques.
            if let Some(stats) = &mut self.stats {
                stats.report();
            }
            return sample;
        }
        let mut s = self.rescale.apply(sample, self.in_bits);
        if let Some(boost) = &self.boost {
            s = boost.apply(s, self.out_bits);
        }
        if let Some(mono) = &mut self.mono {
            s = mono.apply(s, channel);
        }
        if let Some(stats) = &mut self.stats {
            stats.accumulate(s, self.out_bits);
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::widen;

    #[test]
    fn test_rescale_is_left_inverse_of_widening() {
        for out_bits in [8u8, 16, 24] {
            let chain = Rescale::new(out_bits);
            let max = 1i32 << (out_bits - 1);
            for x in [-max, -max / 2, -1, 0, 1, max / 3, max - 1] {
                let wide = widen(x, out_bits);
                assert_eq!(
                    chain.apply(wide, SAMPLE_BITS),
                    x,
                    "out_bits={} x={}",
                    out_bits,
                    x
                );
            }
        }
    }

    #[test]
    fn test_chain_downmixes_to_mono_with_one_frame_delay() {
        let mut chain = FilterChain::new(SampleFormat::Pcm16LeMono).unwrap();
        chain.configure(44_100, 2);
        assert_eq!(chain.plan(), ChannelPlan::MonoDown);
        // Première trame : la moyenne publiée est encore nulle.
        chain.process(widen(1000, 16), 0);
        chain.process(widen(2000, 16), 1);
        // Deuxième trame : la moyenne de la trame précédente sort.
        let mixed = chain.process(widen(1000, 16), 0);
        assert_eq!(mixed, 1500);
    }

    #[test]
    fn test_chain_replicates_when_output_wider() {
        let mut chain = FilterChain::new(SampleFormat::Pcm16LeStereo).unwrap();
        chain.configure(48_000, 1);
        assert_eq!(chain.plan(), ChannelPlan::Replicate);
    }

    #[test]
    fn test_sentinel_passes_through() {
        let mut chain = FilterChain::new(SampleFormat::Pcm16LeStereo)
            .unwrap()
            .with_stats();
        assert_eq!(chain.process(i32::MIN, 0), i32::MIN);
    }

    #[test]
    fn test_non_pcm_output_is_refused() {
        assert!(FilterChain::new(SampleFormat::Mp3).is_err());
    }
}
