//! Battement de cœur : cadence la sortie sur l'horloge murale.
//!
//! Deux variantes, sélectionnées par l'étage qui produit :
//!
//! - **échantillons** : la cible absolue avance de `nsamples / rate`
//!   secondes à chaque battement ; `wait` dort jusqu'à la cible. Une
//!   dérive au-delà de la cible ré-ancre l'horloge et signale un retard.
//! - **débit** : les octets émis s'accumulent ; toutes les 500 ms
//!   d'horloge murale le consommateur est autorisé à repartir.
//!
//! Si un battement est attaché à un jitter, les trames le traversent au
//! rythme de l'horloge, jamais plus vite.

use tokio::time::{sleep_until, Duration, Instant};

/// Métadonnée de cadence portée par une trame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Nombre d'échantillons par canal contenus dans la trame.
    Samples { nsamples: u32 },
    /// Nombre d'octets de la trame.
    Bytes { len: usize },
}

/// Cadence basée sur le compte d'échantillons.
#[derive(Debug)]
pub struct SamplesHeartbeat {
    rate: u32,
    deadline: Option<Instant>,
}

impl SamplesHeartbeat {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            deadline: None,
        }
    }

    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate;
        self.deadline = None;
    }

    fn restart(&mut self) {
        self.deadline = Some(Instant::now());
    }

    async fn wait(&mut self, nsamples: u32) -> bool {
        if self.rate == 0 {
            return false;
        }
        let step = Duration::from_nanos(nsamples as u64 * 1_000_000_000 / self.rate as u64);
        let deadline = match self.deadline {
            Some(previous) => previous + step,
            None => Instant::now() + step,
        };
        let now = Instant::now();
        if now > deadline {
            tracing::warn!(
                "heartbeat late by {:?}, re-anchoring",
                now.duration_since(deadline)
            );
            self.deadline = Some(now);
            return false;
        }
        sleep_until(deadline).await;
        self.deadline = Some(deadline);
        true
    }
}

/// Cadence basée sur le débit : un budget d'octets par tranche de 500 ms.
#[derive(Debug)]
pub struct BitrateHeartbeat {
    /// Budget d'octets consommables par tranche.
    threshold: usize,
    acc: usize,
    tick: Option<Instant>,
}

/// Largeur d'une tranche de débit.
const BITRATE_TICK: Duration = Duration::from_millis(500);

impl BitrateHeartbeat {
    /// `kbytes_per_sec` : débit cible en kilo-octets par seconde.
    pub fn new(kbytes_per_sec: u32) -> Self {
        Self {
            threshold: kbytes_per_sec as usize * 500,
            acc: 0,
            tick: None,
        }
    }

    fn restart(&mut self) {
        self.tick = Some(Instant::now());
        self.acc = 0;
    }

    async fn wait(&mut self, len: usize) -> bool {
        if self.threshold == 0 {
            return false;
        }
        self.acc += len;
        if self.acc < self.threshold {
            return true;
        }
        let tick = self.tick.unwrap_or_else(Instant::now);
        sleep_until(tick + BITRATE_TICK).await;
        self.tick = Some(Instant::now());
        self.acc = 0;
        true
    }
}

/// Battement attaché à un jitter.
#[derive(Debug)]
pub enum Heartbeat {
    Samples(SamplesHeartbeat),
    Bitrate(BitrateHeartbeat),
}

impl Heartbeat {
    pub fn samples(rate: u32) -> Self {
        Heartbeat::Samples(SamplesHeartbeat::new(rate))
    }

    pub fn bitrate(kbytes_per_sec: u32) -> Self {
        Heartbeat::Bitrate(BitrateHeartbeat::new(kbytes_per_sec))
    }

    /// Ré-ancre l'horloge sur l'instant présent.
    pub fn restart(&mut self) {
        match self {
            Heartbeat::Samples(h) => h.restart(),
            Heartbeat::Bitrate(h) => h.restart(),
        }
    }

    /// Attend l'instant où la trame décrite par `beat` peut passer.
    ///
    /// Retourne `false` si l'horloge était en retard et a été ré-ancrée
    /// (la trame passe alors sans attendre).
    pub async fn wait(&mut self, beat: Beat) -> bool {
        match (self, beat) {
            (Heartbeat::Samples(h), Beat::Samples { nsamples }) => h.wait(nsamples).await,
            (Heartbeat::Samples(h), Beat::Bytes { len }) => {
                // Faute de compte d'échantillons, approxime en 16 bits stéréo.
                h.wait((len / 4) as u32).await
            }
            (Heartbeat::Bitrate(h), Beat::Bytes { len }) => h.wait(len).await,
            (Heartbeat::Bitrate(h), Beat::Samples { nsamples }) => {
                h.wait(nsamples as usize * 4).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant as TokioInstant;

    #[tokio::test]
    async fn test_samples_heartbeat_paces() {
        let mut hb = Heartbeat::samples(44_100);
        hb.restart();
        let start = TokioInstant::now();
        // 4410 échantillons = 100 ms nominales, en deux battements.
        hb.wait(Beat::Samples { nsamples: 2205 }).await;
        hb.wait(Beat::Samples { nsamples: 2205 }).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_samples_heartbeat_reanchors_when_late() {
        let mut hb = SamplesHeartbeat::new(48_000);
        hb.restart();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // 48 échantillons = 1 ms cible, largement dépassée.
        let on_time = hb.wait(48).await;
        assert!(!on_time);
        // Après ré-ancrage, le battement suivant est à l'heure.
        let on_time = hb.wait(48).await;
        assert!(on_time);
    }

    #[tokio::test]
    async fn test_bitrate_heartbeat_passes_under_budget() {
        let mut hb = BitrateHeartbeat::new(40);
        hb.restart();
        let start = TokioInstant::now();
        // 40 kB/s → budget de 20 000 octets par tranche : en dessous,
        // aucun blocage.
        assert!(hb.wait(1000).await);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_zero_rate_never_blocks() {
        let mut hb = Heartbeat::samples(0);
        assert!(!hb.wait(Beat::Samples { nsamples: 4800 }).await);
    }
}
