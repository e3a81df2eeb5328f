//! Variante scatter-gather : un anneau de slots à frontières fixes.
//!
//! Chaque slot traverse le cycle `Free → Pull → Ready → Pop → Free`.
//! Le producteur valide des trames entières ; le consommateur les relit
//! dans l'ordre de validation. Utilisée là où le découpage est porteur de
//! sens : datagrammes RTP, trames d'encodeur.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use super::{wait_on, Consume, Frame, JitterState, Peered, Produce};
use crate::{Beat, Heartbeat, SampleFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Pull,
    Ready,
    Pop,
}

struct Slot {
    state: SlotState,
    len: usize,
    beat: Option<Beat>,
    /// Absent tant que la trame est détenue par une extrémité.
    data: Option<Box<[u8]>>,
}

struct Inner {
    slots: Vec<Slot>,
    in_pos: usize,
    out_pos: usize,
    level: usize,
    state: JitterState,
    closed: bool,
}

impl Inner {
    fn init(&mut self, threshold: usize) {
        self.state = if threshold == 0 {
            JitterState::Running
        } else {
            JitterState::Filling
        };
    }
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
    consumer: Mutex<Option<Box<dyn Consume>>>,
}

/// Jitter scatter-gather ; la poignée se clone entre producteur et
/// consommateur.
#[derive(Clone)]
pub struct ScatterJitter {
    shared: Arc<Shared>,
}

impl ScatterJitter {
    pub fn new(name: impl Into<String>, count: usize, size: usize) -> Self {
        let slots = (0..count)
            .map(|_| Slot {
                state: SlotState::Free,
                len: 0,
                beat: None,
                data: Some(vec![0u8; size].into_boxed_slice()),
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                count,
                size,
                threshold: 1,
                format: SampleFormat::Stream,
                frequency: AtomicU32::new(0),
                inner: Mutex::new(Inner {
                    slots,
                    in_pos: 0,
                    out_pos: 0,
                    level: 0,
                    state: JitterState::Stop,
                    closed: false,
                }),
                push_wake: Notify::new(),
                peer_wake: Notify::new(),
                heartbeat: Mutex::new(None),
                producer: Mutex::new(None),
                consumer: Mutex::new(None),
            }),
        }
    }

    /// Niveau de remplissage requis avant de laisser courir le
    /// consommateur, en trames.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("threshold must be set before sharing the jitter");
        shared.threshold = threshold.min(shared.count);
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

    pub async fn install_consumer(&self, consumer: Box<dyn Consume>) {
        *self.shared.consumer.lock().await = Some(consumer);
    }

    /// Obtient une trame libre, en bloquant tant que toutes sont
    /// occupées. Retourne `None` après `close`.
    pub async fn pull(&self) -> Option<Frame> {
        let shared = &self.shared;
        wait_on(&shared.inner, &shared.push_wake, |inner| {
            if inner.closed {
                return Some(None);
            }
            if inner.state == JitterState::Stop {
                inner.init(shared.threshold);
            }
            let pos = inner.in_pos;
            let slot = &mut inner.slots[pos];
            if slot.state == SlotState::Free {
                slot.state = SlotState::Pull;
                let data = slot
                    .data
                    .take()
                    .unwrap_or_else(|| vec![0u8; shared.size].into_boxed_slice());
                Some(Some(Frame { data }))
            } else {
                None
            }
        })
        .await
    }

    /// Valide la trame obtenue par `pull`. `len == 0` signale la fin du
    /// flux et fait passer le jitter en `Complete`.
    pub async fn push(&self, frame: Frame, len: usize, beat: Option<Beat>) {
        let shared = &self.shared;
        let len = len.min(shared.size);
        let mut drive = false;
        {
            let mut inner = shared.inner.lock().await;
            let pos = inner.in_pos;
            let slot = &mut inner.slots[pos];
            if slot.state != SlotState::Pull {
                // push sans pull apparié, ou reset intervenu entre-temps :
                // la trame est abandonnée.
                if slot.data.is_none() {
                    slot.data = Some(frame.data);
                }
                shared.peer_wake.notify_waiters();
                return;
            }
            if len == 0 {
                tracing::debug!("jitter {} push 0", shared.name);
                slot.data = Some(frame.data);
                slot.state = SlotState::Free;
                inner.state = JitterState::Complete;
                shared.peer_wake.notify_waiters();
                return;
            }
            slot.data = Some(frame.data);
            slot.len = len;
            slot.beat = beat;
            slot.state = SlotState::Ready;
            inner.level += 1;
            inner.in_pos = (pos + 1) % shared.count;
            match inner.state {
                JitterState::Running => shared.peer_wake.notify_waiters(),
                JitterState::Complete => {
                    // Une nouvelle piste repart sur un jitter resté en fin
                    // de flux : on reprend le cycle de remplissage.
                    inner.state = if inner.level >= shared.threshold {
                        JitterState::Running
                    } else {
                        JitterState::Filling
                    };
                    shared.peer_wake.notify_waiters();
                }
                JitterState::Filling if inner.level >= shared.threshold => {
                    inner.state = JitterState::Running;
                    shared.peer_wake.notify_waiters();
                }
                _ => {}
            }
            drive = true;
        }
        if drive {
            self.drive_consumer().await;
        }
    }

    pub async fn complete(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        inner.state = JitterState::Complete;
        shared.peer_wake.notify_waiters();
    }

    pub async fn peer(&self) -> Option<Peered> {
        self.peer_inner(true).await
    }

    pub async fn peer_beat(&self) -> Option<Peered> {
        self.peer_inner(false).await
    }

    async fn peer_inner(&self, pace: bool) -> Option<Peered> {
        let shared = &self.shared;
        self.drive_producer().await;
        let peered = wait_on(&shared.inner, &shared.peer_wake, |inner| {
            if inner.closed {
                return Some(None);
            }
            if inner.state == JitterState::Stop {
                inner.init(shared.threshold);
            }
            let pos = inner.out_pos;
            let state = inner.state;
            let slot = &mut inner.slots[pos];
            match slot.state {
                SlotState::Ready => {
                    slot.state = SlotState::Pop;
                    let data = slot
                        .data
                        .take()
                        .unwrap_or_else(|| vec![0u8; shared.size].into_boxed_slice());
                    Some(Some(Peered {
                        data,
                        len: slot.len,
                        beat: slot.beat.take(),
                        slot: pos,
                    }))
                }
                _ => match state {
                    JitterState::Complete | JitterState::Flush => {
                        // La fin de flux se délivre une seule fois ; le
                        // cycle repart ensuite pour la piste suivante.
                        inner.state = JitterState::Stop;
                        Some(None)
                    }
                    _ => None,
                },
            }
        })
        .await?;
        if pace {
            if let Some(beat) = peered.beat {
                if let Some(heartbeat) = self.shared.heartbeat.lock().await.as_mut() {
                    heartbeat.wait(beat).await;
                }
            }
        }
        Some(peered)
    }

    /// Libère la trame obtenue par `peer`. `consumed` est ignoré pour
    /// cette variante : les trames se libèrent entières.
    pub async fn pop(&self, peered: Peered, _consumed: usize) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        let idx = peered.slot;
        let slot = &mut inner.slots[idx];
        if slot.state != SlotState::Pop {
            // pop appelé deux fois, ou reset intervenu.
            if slot.data.is_none() {
                slot.data = Some(peered.data);
            }
            shared.push_wake.notify_waiters();
            return;
        }
        slot.data = Some(peered.data);
        slot.state = SlotState::Free;
        slot.len = 0;
        slot.beat = None;
        inner.level -= 1;
        inner.out_pos = (idx + 1) % shared.count;
        if inner.state == JitterState::Running {
            shared.push_wake.notify_waiters();
        }
        if inner.level == 0 && shared.threshold > 0 {
            if inner.state == JitterState::Flush {
                shared.push_wake.notify_waiters();
            }
            if inner.state == JitterState::Running || inner.state == JitterState::Flush {
                inner.state = JitterState::Filling;
            }
        }
    }

    /// Fin de piste côté producteur : les trames prêtes se drainent, puis
    /// `peer` retourne `None`.
    pub async fn flush(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        let pos = inner.in_pos;
        let slot = &mut inner.slots[pos];
        if slot.state == SlotState::Pull {
            slot.state = SlotState::Free;
        }
        inner.state = JitterState::Flush;
        shared.push_wake.notify_waiters();
        shared.peer_wake.notify_waiters();
    }

    /// Restaure l'état vide et réveille les deux extrémités. Les trames
    /// encore détenues sont abandonnées à leur prochain push/pop.
    pub async fn reset(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        for slot in &mut inner.slots {
            slot.state = SlotState::Free;
            slot.len = 0;
            slot.beat = None;
            if slot.data.is_none() {
                slot.data = Some(vec![0u8; shared.size].into_boxed_slice());
            }
        }
        inner.level = 0;
        inner.in_pos = 0;
        inner.out_pos = 0;
        inner.init(shared.threshold);
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

    /// Longueur validée de la trame courante côté consommateur.
    pub async fn length(&self) -> usize {
        let inner = self.shared.inner.lock().await;
        let slot = &inner.slots[inner.out_pos];
        match slot.state {
            SlotState::Ready | SlotState::Pop => slot.len,
            _ => 0,
        }
    }

    pub async fn is_empty(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.slots[inner.out_pos].state != SlotState::Ready
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

    /// Mode pull : fait produire l'amont sur le fil du consommateur tant
    /// que le seuil n'est pas atteint.
    async fn drive_producer(&self) {
        let shared = &self.shared;
        let mut producer_guard = shared.producer.lock().await;
        let producer = match producer_guard.as_mut() {
            Some(producer) => producer,
            None => return,
        };
        loop {
            {
                let mut inner = shared.inner.lock().await;
                if inner.closed {
                    return;
                }
                if inner.state == JitterState::Stop {
                    inner.init(shared.threshold);
                }
                let filling = inner.state == JitterState::Filling;
                let out_free = inner.slots[inner.out_pos].state == SlotState::Free;
                let caught_up = inner.in_pos == inner.out_pos;
                if !(filling || (out_free && caught_up)) {
                    return;
                }
            }
            let Some(mut frame) = self.pull().await else {
                return;
            };
            let mut len = 0usize;
            loop {
                match producer.produce(&mut frame.data[len..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        len += n;
                        if len >= shared.size {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!("jitter {} produce error: {}", shared.name, err);
                        len = 0;
                        break;
                    }
                }
            }
            self.push(frame, len, None).await;
            if len == 0 {
                return;
            }
        }
    }

    /// Mode callback côté consommateur : draine les trames prêtes sur le
    /// fil du producteur.
    async fn drive_consumer(&self) {
        let shared = &self.shared;
        let mut consumer_guard = shared.consumer.lock().await;
        let consumer = match consumer_guard.as_mut() {
            Some(consumer) => consumer,
            None => return,
        };
        loop {
            let peered = {
                let mut inner = shared.inner.lock().await;
                let pos = inner.out_pos;
                let slot = &mut inner.slots[pos];
                if slot.state != SlotState::Ready {
                    return;
                }
                slot.state = SlotState::Pop;
                let data = slot
                    .data
                    .take()
                    .unwrap_or_else(|| vec![0u8; shared.size].into_boxed_slice());
                Peered {
                    data,
                    len: slot.len,
                    beat: slot.beat.take(),
                    slot: pos,
                }
            };
            if let Some(beat) = peered.beat {
                if let Some(heartbeat) = shared.heartbeat.lock().await.as_mut() {
                    heartbeat.wait(beat).await;
                }
            }
            let mut written = 0usize;
            let mut failed = false;
            while written < peered.len {
                match consumer.consume(&peered.data[written..peered.len]) {
                    Ok(0) => {
                        failed = true;
                        break;
                    }
                    Ok(n) => written += n,
                    Err(err) => {
                        tracing::warn!("jitter {} consume error: {}", shared.name, err);
                        failed = true;
                        break;
                    }
                }
            }
            self.pop(peered, written).await;
            if failed {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Jitter;

    fn jitter(count: usize, threshold: usize) -> ScatterJitter {
        ScatterJitter::new("test", count, 8).with_threshold(threshold)
    }

    #[tokio::test]
    async fn test_push_then_peer_preserves_frames() {
        let j = jitter(4, 1);
        for value in 0u8..3 {
            let mut frame = j.pull().await.unwrap();
            frame.data_mut()[..4].fill(value);
            j.push(frame, 4, None).await;
        }
        assert_eq!(j.level().await, 3);
        for value in 0u8..3 {
            let peered = j.peer().await.unwrap();
            assert_eq!(peered.len(), 4);
            assert_eq!(peered.data(), &[value; 4]);
            j.pop(peered, 4).await;
        }
        assert_eq!(j.level().await, 0);
    }

    #[tokio::test]
    async fn test_level_stays_bounded() {
        let j = jitter(2, 1);
        let handle = {
            let j = j.clone();
            tokio::spawn(async move {
                for _ in 0..10 {
                    let frame = j.pull().await.unwrap();
                    j.push(frame, 8, None).await;
                }
                j.complete().await;
            })
        };
        let mut seen = 0;
        loop {
            assert!(j.level().await <= 2);
            match j.peer().await {
                Some(peered) => {
                    seen += 1;
                    j.pop(peered, 8).await;
                }
                None => break,
            }
        }
        assert_eq!(seen, 10);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_push_completes() {
        let j = jitter(4, 1);
        let frame = j.pull().await.unwrap();
        j.push(frame, 0, None).await;
        assert_eq!(j.state().await, JitterState::Complete);
        assert!(j.peer().await.is_none());
    }

    #[tokio::test]
    async fn test_threshold_blocks_consumer() {
        let j = jitter(4, 3);
        let frame = j.pull().await.unwrap();
        j.push(frame, 8, None).await;
        // Une seule trame prête sur les trois requises : peer doit bloquer.
        let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), j.peer()).await;
        assert!(blocked.is_err());
        assert_eq!(j.state().await, JitterState::Filling);
        for _ in 0..2 {
            let frame = j.pull().await.unwrap();
            j.push(frame, 8, None).await;
        }
        assert_eq!(j.state().await, JitterState::Running);
        assert!(j.peer().await.is_some());
    }

    #[tokio::test]
    async fn test_reset_unblocks_and_empties() {
        let j = jitter(2, 1);
        for _ in 0..2 {
            let frame = j.pull().await.unwrap();
            j.push(frame, 8, None).await;
        }
        // Producteur bloqué sur un jitter plein.
        let blocked = {
            let j = j.clone();
            tokio::spawn(async move { j.pull().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        j.reset().await;
        // Le pull bloqué obtient une trame libre après reset.
        assert!(blocked.await.unwrap().is_some());
        assert_eq!(j.level().await, 0);
        assert!(j.is_empty().await);
    }

    #[tokio::test]
    async fn test_flush_drains_then_ends() {
        let j = jitter(4, 1);
        let mut frame = j.pull().await.unwrap();
        frame.data_mut()[0] = 42;
        j.push(frame, 1, None).await;
        j.flush().await;
        let peered = j.peer().await.unwrap();
        assert_eq!(peered.data(), &[42]);
        j.pop(peered, 1).await;
        assert!(j.peer().await.is_none());
    }

    #[tokio::test]
    async fn test_close_unblocks_both_ends() {
        let j = jitter(1, 1);
        let consumer = {
            let j = j.clone();
            tokio::spawn(async move { j.peer().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        j.close().await;
        assert!(consumer.await.unwrap().is_none());
        assert!(j.pull().await.is_none());
    }

    struct CollectingConsumer {
        out: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    }

    impl Consume for CollectingConsumer {
        fn consume(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.out.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[tokio::test]
    async fn test_inline_consumer_drains_on_push() {
        let j = jitter(4, 1);
        let collected = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        j.install_consumer(Box::new(CollectingConsumer {
            out: collected.clone(),
        }))
        .await;
        // Pas de tâche de consommation : push draine en ligne.
        for value in 0u8..3 {
            let mut frame = j.pull().await.unwrap();
            frame.data_mut()[..2].fill(value);
            j.push(frame, 2, None).await;
        }
        assert_eq!(*collected.lock().unwrap(), vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(j.level().await, 0);
    }

    struct CountingProducer {
        left: usize,
    }

    impl Produce for CountingProducer {
        fn produce(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.left == 0 {
                return Ok(0);
            }
            self.left -= 1;
            buf[0] = self.left as u8;
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_pull_mode_drives_producer_inline() {
        let j = Jitter::Scatter(jitter(4, 1));
        j.install_producer(Box::new(CountingProducer { left: 3 }))
            .await;
        // Aucune tâche amont : peer fait produire en ligne, trois octets
        // avant la fin du producteur.
        let peered = j.peer().await.unwrap();
        assert_eq!(peered.data(), &[2, 1, 0]);
        j.pop(peered, 3).await;
    }
}
