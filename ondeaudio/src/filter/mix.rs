//! Mixage mono : moyenne de tous les canaux d'entrée.

pub const MAX_CHANNELS: usize = 8;

/// Réduit un flux multicanal en mono par moyenne.
///
/// Les échantillons d'une trame sont mémorisés canal par canal ; la
/// moyenne publiée sur le canal 0 est celle de la trame précédente
/// (retard d'une trame, inaudible à l'échelle d'un échantillon).
#[derive(Debug)]
pub struct MonoMix {
    samples: [i32; MAX_CHANNELS],
    channels: usize,
    mixed: i32,
}

impl MonoMix {
    pub fn new(channels: usize) -> Self {
        Self {
            samples: [0; MAX_CHANNELS],
            channels: channels.min(MAX_CHANNELS),
            mixed: 0,
        }
    }

    #[inline]
    pub fn apply(&mut self, sample: i32, channel: usize) -> i32 {
        if channel == 0 {
            self.mixed = self.samples[..self.channels]
                .iter()
                .map(|s| s / self.channels as i32)
                .sum();
        }
        if channel < MAX_CHANNELS {
            self.samples[channel] = sample;
        }
        self.mixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_of_previous_frame() {
        let mut mix = MonoMix::new(2);
        mix.apply(100, 0);
        mix.apply(300, 1);
        assert_eq!(mix.apply(0, 0), 200);
    }

    #[test]
    fn test_channels_beyond_limit_are_ignored() {
        let mut mix = MonoMix::new(2);
        mix.apply(100, 0);
        mix.apply(100, 1);
        // Canal hors plage : pas de panique, pas d'effet.
        mix.apply(9999, 12);
        assert_eq!(mix.apply(0, 0), 100);
    }
}
