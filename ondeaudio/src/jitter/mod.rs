//! Jitters : files bornées de trames entre deux étages du pipeline.
//!
//! Chaque paire d'étages est couplée par un jitter qui absorbe la variance
//! de cadence amont. Deux variantes partagent la même interface :
//!
//! - [`ScatterJitter`] : trames à frontières fixes, pour les étages où le
//!   découpage est sémantique (paquets RTP, trames encodées) ;
//! - [`RingJitter`] : anneau d'octets à push/pop de longueur variable,
//!   pour les consommateurs qui lisent un flux continu (décodeurs).
//!
//! Le producteur obtient une trame par `pull`, la valide par `push` ;
//! le consommateur l'obtient par `peer` et la libère par `pop`. `flush`
//! draine puis termine la piste en cours, `reset` rétablit l'état vide et
//! réveille les deux extrémités. Aucune opération ne doit rester bloquée
//! pendant un démontage : `reset` et `close` réveillent tous les
//! dormeurs.

mod ring;
mod scattergather;

pub use ring::RingJitter;
pub use scattergather::ScatterJitter;

use std::io;

use tokio::sync::{Mutex, Notify};

use crate::{Beat, Heartbeat, SampleFormat};

/// Cycle de vie d'un jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterState {
    Stop,
    /// Bloque les consommateurs jusqu'à `threshold` trames prêtes.
    Filling,
    Running,
    /// Fin de piste coopérative : draine puis `peer` rend `None`.
    Flush,
    /// Plus aucune trame à venir pour la piste courante.
    Complete,
}

/// Trame en cours d'écriture, détenue par le producteur entre `pull` et
/// `push`.
pub struct Frame {
    pub(crate) data: Box<[u8]>,
}

impl Frame {
    pub(crate) fn alloc(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Trame lisible, détenue par le consommateur entre `peer` et `pop`.
pub struct Peered {
    pub(crate) data: Box<[u8]>,
    pub(crate) len: usize,
    pub(crate) beat: Option<Beat>,
    /// Slot d'origine pour la variante scatter-gather.
    pub(crate) slot: usize,
}

impl Peered {
    /// Les octets valides de la trame.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn beat(&self) -> Option<Beat> {
        self.beat
    }
}

/// Production pilotée par le consommateur (« mode pull ») : quand un
/// producteur est installé, `peer` le fait produire en ligne au lieu
/// d'attendre une tâche amont.
pub trait Produce: Send {
    /// Remplit `buf`, retourne le nombre d'octets produits ; `0` signifie
    /// fin de flux.
    fn produce(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Consommation en ligne côté producteur : quand un consommateur est
/// installé, `push` l'appelle sur le fil du producteur.
pub trait Consume: Send {
    fn consume(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Attente sur condition : enregistre l'intérêt avant de vérifier la
/// condition pour ne perdre aucun réveil, à la manière d'une condvar.
pub(crate) async fn wait_on<T, R>(
    mutex: &Mutex<T>,
    notify: &Notify,
    mut cond: impl FnMut(&mut T) -> Option<R>,
) -> R {
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let mut inner = mutex.lock().await;
            if let Some(result) = cond(&mut inner) {
                return result;
            }
        }
        notified.as_mut().await;
    }
}

/// Poignée uniforme sur l'une ou l'autre variante.
///
/// Les étages génériques (sources, player) manipulent ce type sans
/// connaître la variante choisie par l'étage aval.
#[derive(Clone)]
pub enum Jitter {
    Scatter(ScatterJitter),
    Ring(RingJitter),
}

macro_rules! dispatch {
    ($self:ident, $j:ident => $body:expr) => {
        match $self {
            Jitter::Scatter($j) => $body,
            Jitter::Ring($j) => $body,
        }
    };
}

impl Jitter {
    pub fn name(&self) -> &str {
        dispatch!(self, j => j.name())
    }

    pub fn count(&self) -> usize {
        dispatch!(self, j => j.count())
    }

    pub fn size(&self) -> usize {
        dispatch!(self, j => j.size())
    }

    pub fn threshold(&self) -> usize {
        dispatch!(self, j => j.threshold())
    }

    pub fn format(&self) -> SampleFormat {
        dispatch!(self, j => j.format())
    }

    /// Fréquence négociée ; `0` = héritée de l'amont, fixée par le
    /// producteur à la première trame décodée.
    pub fn frequency(&self) -> u32 {
        dispatch!(self, j => j.frequency())
    }

    pub fn set_frequency(&self, rate: u32) {
        dispatch!(self, j => j.set_frequency(rate))
    }

    pub async fn set_heartbeat(&self, heartbeat: Heartbeat) {
        dispatch!(self, j => j.set_heartbeat(heartbeat).await)
    }

    pub async fn install_producer(&self, producer: Box<dyn Produce>) {
        dispatch!(self, j => j.install_producer(producer).await)
    }

    /// Consommation en ligne ; seule la variante scatter-gather la
    /// supporte, l'anneau n'ayant pas de frontière de trame à livrer.
    pub async fn install_consumer(&self, consumer: Box<dyn Consume>) {
        match self {
            Jitter::Scatter(j) => j.install_consumer(consumer).await,
            Jitter::Ring(j) => {
                tracing::warn!("jitter {}: inline consumer unsupported on ring", j.name())
            }
        }
    }

    pub async fn pull(&self) -> Option<Frame> {
        dispatch!(self, j => j.pull().await)
    }

    pub async fn push(&self, frame: Frame, len: usize, beat: Option<Beat>) {
        dispatch!(self, j => j.push(frame, len, beat).await)
    }

    /// Fin de flux sans trame en main : équivaut à un `push` vide.
    pub async fn complete(&self) {
        dispatch!(self, j => j.complete().await)
    }

    /// Trame suivante, cadencée par le battement attaché le cas échéant.
    pub async fn peer(&self) -> Option<Peered> {
        dispatch!(self, j => j.peer().await)
    }

    /// Trame suivante sans attendre le battement : l'appelant reçoit la
    /// métadonnée et cadence lui-même.
    pub async fn peer_beat(&self) -> Option<Peered> {
        dispatch!(self, j => j.peer_beat().await)
    }

    pub async fn pop(&self, peered: Peered, consumed: usize) {
        dispatch!(self, j => j.pop(peered, consumed).await)
    }

    pub async fn flush(&self) {
        dispatch!(self, j => j.flush().await)
    }

    pub async fn reset(&self) {
        dispatch!(self, j => j.reset().await)
    }

    /// Démontage : toute opération en attente retourne `None`.
    pub async fn close(&self) {
        dispatch!(self, j => j.close().await)
    }

    pub async fn length(&self) -> usize {
        dispatch!(self, j => j.length().await)
    }

    pub async fn is_empty(&self) -> bool {
        dispatch!(self, j => j.is_empty().await)
    }

    /// Remplissage courant : trames prêtes (scatter-gather) ou octets en
    /// attente (anneau).
    pub async fn level(&self) -> usize {
        dispatch!(self, j => j.level().await)
    }

    pub async fn state(&self) -> JitterState {
        dispatch!(self, j => j.state().await)
    }

    /// Vrai après `close` : permet aux consommateurs de distinguer la fin
    /// de piste (repartir) du démontage (sortir).
    pub async fn is_closed(&self) -> bool {
        dispatch!(self, j => j.is_closed().await)
    }
}
