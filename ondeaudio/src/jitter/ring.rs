//! Variante anneau : un tampon d'octets contigu à longueurs variables.
//!
//! Le magasin est un tampon unique bordé d'une zone de recouvrement d'une
//! trame (`size`) à chaque extrémité, si bien qu'une lecture à cheval sur
//! la fin voit toujours `size` octets contigus : les octets de queue sont
//! recopiés en préfixe avant d'être servis, et les octets qui débordent de
//! la fin à l'écriture sont reportés en tête. Push et pop acceptent des
//! longueurs arbitraires ≤ `size`. Utilisée quand le consommateur extrait
//! des blocs d'un flux d'octets (entrée des décodeurs).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use super::{wait_on, Frame, JitterState, Peered, Produce};
use crate::{Beat, Heartbeat, SampleFormat};

struct Inner {
    data: Vec<u8>,
    /// Offset d'écriture, dans `[start, end)`.
    in_off: usize,
    /// Offset de lecture, dans `[start - size, end)`.
    out_off: usize,
    /// Octets en attente.
    level: usize,
    /// Passe à `false` sur un push vide (fin de flux).
    in_open: bool,
    state: JitterState,
    closed: bool,
}

struct Shared {
    name: String,
    count: usize,
    size: usize,
    threshold: usize,
    format: SampleFormat,
    frequency: AtomicU32,
    inner: Mutex<Inner>,
    push_wake: Notify,
    peer_wake: Notify,
    heartbeat: Mutex<Option<Heartbeat>>,
    producer: Mutex<Option<Box<dyn Produce>>>,
}

/// Jitter en anneau ; la poignée se clone entre producteur et
/// consommateur.
#[derive(Clone)]
pub struct RingJitter {
    shared: Arc<Shared>,
}

impl RingJitter {
    pub fn new(name: impl Into<String>, count: usize, size: usize) -> Self {
        // Une trame de recouvrement à chaque extrémité.
        let data = vec![0u8; (count + 2) * size];
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                count,
                size,
                threshold: 1,
                format: SampleFormat::Stream,
                frequency: AtomicU32::new(0),
                inner: Mutex::new(Inner {
                    data,
                    in_off: size,
                    out_off: size,
                    level: 0,
                    in_open: true,
                    state: JitterState::Stop,
                    closed: false,
                }),
                push_wake: Notify::new(),
                peer_wake: Notify::new(),
                heartbeat: Mutex::new(None),
                producer: Mutex::new(None),
            }),
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("threshold must be set before sharing the jitter");
        shared.threshold = threshold.clamp(1, shared.count);
        self
    }

    pub fn with_format(mut self, format: SampleFormat) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("format must be set before sharing the jitter");
        shared.format = format;
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn count(&self) -> usize {
        self.shared.count
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn threshold(&self) -> usize {
        self.shared.threshold
    }

    pub fn format(&self) -> SampleFormat {
        self.shared.format
    }

    pub fn frequency(&self) -> u32 {
        self.shared.frequency.load(Ordering::Acquire)
    }

    pub fn set_frequency(&self, rate: u32) {
        self.shared.frequency.store(rate, Ordering::Release);
    }

    pub async fn set_heartbeat(&self, heartbeat: Heartbeat) {
        *self.shared.heartbeat.lock().await = Some(heartbeat);
    }

    pub async fn install_producer(&self, producer: Box<dyn Produce>) {
        *self.shared.producer.lock().await = Some(producer);
        self.shared.peer_wake.notify_waiters();
    }

    fn start(&self) -> usize {
        self.shared.size
    }

    fn end(&self) -> usize {
        self.shared.size + self.shared.count * self.shared.size
    }

    /// Attend qu'une trame entière puisse entrer, puis retourne un tampon
    /// de travail. `None` après fin de flux ou `close`.
    pub async fn pull(&self) -> Option<Frame> {
        let shared = &self.shared;
        let capacity = shared.count * shared.size;
        wait_on(&shared.inner, &shared.push_wake, |inner| {
            if inner.closed || !inner.in_open {
                return Some(None);
            }
            if inner.state == JitterState::Stop {
                inner.state = JitterState::Filling;
            }
            if inner.level + shared.size > capacity {
                None
            } else {
                Some(Some(Frame::alloc(shared.size)))
            }
        })
        .await
    }

    /// Recopie `frame[..len]` dans l'anneau. `len == 0` ferme l'entrée.
    pub async fn push(&self, frame: Frame, len: usize, _beat: Option<Beat>) {
        let shared = &self.shared;
        if len == 0 {
            self.complete().await;
            return;
        }
        let len = len.min(shared.size);
        let start = self.start();
        let end = self.end();
        let mut inner = shared.inner.lock().await;
        if inner.closed || !inner.in_open {
            tracing::warn!("jitter {} push after end of stream", shared.name);
            return;
        }
        let in_off = inner.in_off;
        inner.data[in_off..in_off + len].copy_from_slice(&frame.data[..len]);
        inner.level += len;
        inner.in_off += len;
        if inner.in_off >= end {
            // Report du débordement dans la zone de recouvrement de tête.
            let over = inner.in_off - end;
            inner.data.copy_within(end..end + over, start);
            inner.in_off = start + over;
        }
        match inner.state {
            JitterState::Running => shared.peer_wake.notify_waiters(),
            JitterState::Filling if inner.level >= shared.threshold * shared.size => {
                inner.state = JitterState::Running;
                shared.peer_wake.notify_waiters();
            }
            _ => {}
        }
    }

    /// Fin de flux : l'entrée se ferme, le reliquat se draine.
    pub async fn complete(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        tracing::debug!("jitter {} push 0", shared.name);
        inner.in_open = false;
        shared.peer_wake.notify_waiters();
        shared.push_wake.notify_waiters();
    }

    pub async fn peer(&self) -> Option<Peered> {
        self.peer_inner().await
    }

    /// L'anneau ne transporte pas de battement : identique à [`peer`].
    ///
    /// [`peer`]: RingJitter::peer
    pub async fn peer_beat(&self) -> Option<Peered> {
        self.peer_inner().await
    }

    async fn peer_inner(&self) -> Option<Peered> {
        let shared = &self.shared;
        let has_producer = self.drive_producer().await;
        let start = self.start();
        let end = self.end();
        wait_on(&shared.inner, &shared.peer_wake, |inner| {
            if inner.closed {
                return Some(None);
            }
            if inner.state == JitterState::Stop {
                inner.state = JitterState::Filling;
            }
            if inner.state == JitterState::Filling && inner.in_open && !has_producer {
                return None;
            }
            if inner.level > 0 {
                if inner.out_off + shared.size > end {
                    // Recopie de la queue en préfixe : la lecture reste
                    // contiguë à travers le bouclage.
                    let tail = end - inner.out_off;
                    let out_off = inner.out_off;
                    inner.data.copy_within(out_off..end, start - tail);
                    inner.out_off = start - tail;
                }
                let avail = inner.level.min(shared.size);
                let out_off = inner.out_off;
                let copy = inner.data[out_off..out_off + avail].to_vec();
                Some(Some(Peered {
                    data: copy.into_boxed_slice(),
                    len: avail,
                    beat: None,
                    slot: 0,
                }))
            } else if !inner.in_open
                || matches!(inner.state, JitterState::Flush | JitterState::Complete)
            {
                // Fin de flux délivrée une seule fois ; l'entrée rouvre
                // pour une piste suivante éventuelle.
                inner.in_open = true;
                inner.state = JitterState::Stop;
                Some(None)
            } else {
                None
            }
        })
        .await
    }

    /// Avance la lecture de `consumed` octets.
    pub async fn pop(&self, peered: Peered, consumed: usize) {
        let shared = &self.shared;
        let consumed = consumed.min(peered.len);
        let mut inner = shared.inner.lock().await;
        if inner.closed {
            return;
        }
        let consumed = consumed.min(inner.level);
        inner.out_off += consumed;
        inner.level -= consumed;
        if inner.level == 0 && inner.in_open && inner.state == JitterState::Running {
            inner.state = JitterState::Filling;
        }
        shared.push_wake.notify_waiters();
    }

    pub async fn flush(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        inner.state = JitterState::Flush;
        shared.push_wake.notify_waiters();
        shared.peer_wake.notify_waiters();
    }

    pub async fn reset(&self) {
        let shared = &self.shared;
        let start = self.start();
        let mut inner = shared.inner.lock().await;
        inner.in_off = start;
        inner.out_off = start;
        inner.level = 0;
        inner.in_open = true;
        inner.state = JitterState::Stop;
        shared.push_wake.notify_waiters();
        shared.peer_wake.notify_waiters();
    }

    pub async fn close(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        inner.closed = true;
        shared.push_wake.notify_waiters();
        shared.peer_wake.notify_waiters();
    }

    /// Octets lisibles immédiatement, plafonnés à une trame.
    pub async fn length(&self) -> usize {
        let inner = self.shared.inner.lock().await;
        inner.level.min(self.shared.size)
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.inner.lock().await.level == 0
    }

    pub async fn level(&self) -> usize {
        self.shared.inner.lock().await.level
    }

    pub async fn state(&self) -> JitterState {
        self.shared.inner.lock().await.state
    }

    /// Vrai après `close` : le pipeline se démonte.
    pub async fn is_closed(&self) -> bool {
        self.shared.inner.lock().await.closed
    }

    /// Mode pull : produit en ligne jusqu'au seuil. Retourne `true` si un
    /// producteur est installé.
    async fn drive_producer(&self) -> bool {
        let shared = &self.shared;
        let mut producer_guard = shared.producer.lock().await;
        let producer = match producer_guard.as_mut() {
            Some(producer) => producer,
            None => return false,
        };
        loop {
            {
                let mut inner = shared.inner.lock().await;
                if inner.closed || !inner.in_open {
                    return true;
                }
                if inner.state == JitterState::Stop {
                    inner.state = JitterState::Filling;
                }
                if inner.state != JitterState::Filling
                    || inner.level + shared.size > shared.count * shared.size
                {
                    return true;
                }
            }
            let mut frame = Frame::alloc(shared.size);
            match producer.produce(&mut frame.data) {
                Ok(0) => {
                    self.complete().await;
                    return true;
                }
                Ok(n) => self.push(frame, n, None).await,
                Err(err) => {
                    tracing::warn!("jitter {} produce error: {}", shared.name, err);
                    self.complete().await;
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(count: usize, size: usize, threshold: usize) -> RingJitter {
        RingJitter::new("test", count, size).with_threshold(threshold)
    }

    async fn push_bytes(j: &RingJitter, bytes: &[u8]) {
        let mut frame = j.pull().await.unwrap();
        frame.data_mut()[..bytes.len()].copy_from_slice(bytes);
        j.push(frame, bytes.len(), None).await;
    }

    #[tokio::test]
    async fn test_bytes_read_in_push_order() {
        let j = ring(4, 8, 1);
        push_bytes(&j, &[1, 2, 3]).await;
        push_bytes(&j, &[4, 5]).await;
        push_bytes(&j, &[6, 7, 8, 9]).await;
        let mut seen = Vec::new();
        while seen.len() < 9 {
            let peered = j.peer().await.unwrap();
            seen.extend_from_slice(peered.data());
            let len = peered.len();
            j.pop(peered, len).await;
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_wraparound_stays_contiguous() {
        let j = ring(3, 4, 1);
        let mut pushed = Vec::new();
        let mut popped = Vec::new();
        let mut counter = 0u8;
        let mut chunk = |n: usize| -> Vec<u8> {
            (0..n)
                .map(|_| {
                    counter = counter.wrapping_add(1);
                    counter
                })
                .collect()
        };
        // Plusieurs tours de l'anneau avec des longueurs qui ne divisent
        // pas la capacité : l'écriture et la lecture traversent toutes
        // deux les zones de recouvrement.
        for _ in 0..40 {
            for len in [3usize, 4] {
                let bytes = chunk(len);
                push_bytes(&j, &bytes).await;
                pushed.extend_from_slice(&bytes);
            }
            while !j.is_empty().await {
                let peered = j.peer().await.unwrap();
                popped.extend_from_slice(peered.data());
                let len = peered.len();
                j.pop(peered, len).await;
            }
        }
        assert_eq!(pushed, popped);
    }

    #[tokio::test]
    async fn test_level_accounting() {
        let j = ring(4, 8, 1);
        push_bytes(&j, &[0; 5]).await;
        push_bytes(&j, &[0; 7]).await;
        assert_eq!(j.level().await, 12);
        let peered = j.peer().await.unwrap();
        j.pop(peered, 4).await;
        assert_eq!(j.level().await, 8);
    }

    #[tokio::test]
    async fn test_partial_pop_keeps_remainder() {
        let j = ring(4, 6, 1);
        push_bytes(&j, &[10, 11, 12, 13, 14, 15]).await;
        let peered = j.peer().await.unwrap();
        assert_eq!(peered.data(), &[10, 11, 12, 13, 14, 15]);
        j.pop(peered, 2).await;
        let peered = j.peer().await.unwrap();
        assert_eq!(peered.data(), &[12, 13, 14, 15]);
        j.pop(peered, 4).await;
    }

    #[tokio::test]
    async fn test_eos_drains_then_none() {
        let j = ring(4, 8, 1);
        push_bytes(&j, &[1, 2, 3]).await;
        j.complete().await;
        // Le producteur ne peut plus écrire.
        assert!(j.pull().await.is_none());
        let peered = j.peer().await.unwrap();
        assert_eq!(peered.data(), &[1, 2, 3]);
        j.pop(peered, 3).await;
        assert!(j.peer().await.is_none());
    }

    #[tokio::test]
    async fn test_threshold_gates_filling() {
        let j = ring(4, 8, 2);
        push_bytes(&j, &[0; 8]).await;
        // 8 octets sur les 16 du seuil : le consommateur attend.
        let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), j.peer()).await;
        assert!(blocked.is_err());
        push_bytes(&j, &[0; 8]).await;
        assert_eq!(j.state().await, JitterState::Running);
        assert!(j.peer().await.is_some());
    }

    #[tokio::test]
    async fn test_reset_restores_empty_state() {
        let j = ring(2, 4, 1);
        push_bytes(&j, &[1, 2, 3, 4]).await;
        push_bytes(&j, &[5, 6, 7, 8]).await;
        let blocked = {
            let j = j.clone();
            tokio::spawn(async move { j.pull().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        j.reset().await;
        assert!(blocked.await.unwrap().is_some());
        assert_eq!(j.level().await, 0);
        assert!(j.is_empty().await);
    }
}
