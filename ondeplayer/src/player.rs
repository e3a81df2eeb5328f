//! La machine de transport et la composition du pipeline par piste.
//!
//! La boucle principale pilote les transitions Stop/Change/Play :
//! elle itère le curseur de média, construit la source par dispatch
//! d'URL, attache paresseusement un décodeur par flux élémentaire au
//! fil des événements `NewEs`, et rediffuse chaque changement d'état ou
//! de piste à ses auditeurs. La pause se joue côté décodeur : avant
//! chaque trame PCM poussée, celui-ci attend que l'état quitte `Pause`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch, Mutex};

use ondeaudio::{FilterChain, Jitter};
use ondecodec::{Decoder, JitterProfile, Transport};
use ondestream::{EsLatency, Source, SourceEvent};
use ondeutils::media_url::MediaUrl;

use crate::error::{PlayerError, Result};
use crate::media::{Media, MediaEntry};
use crate::state::{requested_transition, State};

/// Notification poussée aux auditeurs à chaque changement d'état ou de
/// piste.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackChange {
    pub state: State,
    pub media_id: Option<i64>,
}

struct Shared {
    state_tx: watch::Sender<State>,
    change_tx: watch::Sender<TrackChange>,
    current_id: AtomicI64,
}

impl Shared {
    fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    fn current_id(&self) -> Option<i64> {
        match self.current_id.load(Ordering::Acquire) {
            -1 => None,
            id => Some(id),
        }
    }

    fn notify(&self) {
        let change = TrackChange {
            state: self.state(),
            media_id: self.current_id(),
        };
        self.change_tx.send_if_modified(|current| {
            if *current != change {
                *current = change;
                true
            } else {
                false
            }
        });
    }
}

/// Curseur de média partagé entre le player et le plan de contrôle.
pub type SharedMedia = Arc<StdMutex<Box<dyn Media>>>;

type DecoderSlot = (u32, Box<dyn Decoder>, usize);

/// Le player : possède la source, les décodeurs et les jitters de
/// sortie de la piste courante.
pub struct Player {
    shared: Arc<Shared>,
    media: SharedMedia,
    outstreams: Vec<Jitter>,
    decoders: Arc<Mutex<Vec<DecoderSlot>>>,
    source: Option<Box<dyn Source>>,
    current: Option<MediaEntry>,
    stats_filter: bool,
}

impl Player {
    pub fn new(media: Box<dyn Media>) -> Self {
        let (state_tx, _) = watch::channel(State::Stop);
        let (change_tx, _) = watch::channel(TrackChange {
            state: State::Stop,
            media_id: None,
        });
        Self {
            shared: Arc::new(Shared {
                state_tx,
                change_tx,
                current_id: AtomicI64::new(-1),
            }),
            media: Arc::new(StdMutex::new(media)),
            outstreams: Vec::new(),
            decoders: Arc::new(Mutex::new(Vec::new())),
            source: None,
            current: None,
            stats_filter: false,
        }
    }

    /// Active le filtre de statistiques sur les pistes à venir.
    pub fn with_stats_filter(mut self) -> Self {
        self.stats_filter = true;
        self
    }

    /// Abonne un jitter de sortie (l'entrée d'un encodeur). À appeler
    /// avant `run`.
    pub fn subscribe_output(&mut self, jitter: Jitter) {
        self.outstreams.push(jitter);
    }

    pub fn handle(&self) -> PlayerHandle {
        PlayerHandle {
            shared: self.shared.clone(),
            media: self.media.clone(),
            decoders: self.decoders.clone(),
        }
    }

    fn set_state(&self, state: State) {
        self.shared.state_tx.send_replace(state);
    }

    /// Boucle principale ; ne rend la main que sur l'état `Error` ou
    /// quand plus personne ne détient de poignée d'état.
    pub async fn run(&mut self) -> Result<()> {
        if self.outstreams.is_empty() {
            return Err(PlayerError::NoOutput);
        }
        let mut state_rx = self.shared.state_tx.subscribe();
        let mut events: Option<mpsc::Receiver<SourceEvent>> = None;
        let mut es_index = 0usize;

        loop {
            let state = *state_rx.borrow_and_update();
            self.shared.notify();
            match state {
                State::Error => {
                    tracing::error!("player: fatal state, shutting down");
                    self.teardown(&mut events).await;
                    break;
                }
                State::Stop => {
                    tracing::debug!("player: stopping");
                    for jitter in &self.outstreams {
                        jitter.flush().await;
                    }
                    self.teardown(&mut events).await;
                    es_index = 0;
                    if let Ok(mut media) = self.media.lock() {
                        media.end();
                    }
                    // Laisse les trames déjà validées se drainer vers
                    // l'aval avant de vider les jitters.
                    let drained = tokio::time::timeout(std::time::Duration::from_millis(500), {
                        let outstreams = self.outstreams.clone();
                        async move {
                            for jitter in &outstreams {
                                while !jitter.is_empty().await {
                                    tokio::time::sleep(std::time::Duration::from_millis(10))
                                        .await;
                                }
                            }
                        }
                    })
                    .await;
                    if drained.is_err() {
                        tracing::debug!("player: output not drained, resetting anyway");
                    }
                    for jitter in &self.outstreams {
                        jitter.reset().await;
                    }
                    self.shared.current_id.store(-1, Ordering::Release);
                    self.shared.notify();
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                }
                State::Change => {
                    self.teardown(&mut events).await;
                    es_index = 0;
                    let entry = match self.media.lock() {
                        Ok(mut media) => media.next(),
                        Err(_) => None,
                    };
                    match entry {
                        Some(entry) => {
                            tracing::info!("player: track {} {}", entry.id, entry.url);
                            match self.start_track(&entry).await {
                                Ok(rx) => {
                                    events = Some(rx);
                                    self.shared.current_id.store(entry.id, Ordering::Release);
                                    self.set_state(State::Play);
                                }
                                Err(err) => {
                                    tracing::warn!(
                                        "player: cannot start {}: {}, skipping",
                                        entry.url,
                                        err
                                    );
                                    // Laisse respirer avant la piste suivante
                                    // quand toute la liste est en échec.
                                    tokio::time::sleep(std::time::Duration::from_millis(200))
                                        .await;
                                    self.set_state(State::Change);
                                }
                            }
                        }
                        None => {
                            tracing::info!("player: playlist exhausted");
                            self.set_state(State::Stop);
                        }
                    }
                }
                State::Play | State::Pause => {
                    tokio::select! {
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        event = recv_event(&mut events) => {
                            match event {
                                Some(event) => self.handle_event(event, &mut es_index).await,
                                None => events = None,
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn start_track(&mut self, entry: &MediaEntry) -> Result<mpsc::Receiver<SourceEvent>> {
        let url = MediaUrl::parse(&entry.url).map_err(ondestream::StreamError::Url)?;
        let mut source = ondestream::build_source(&url, entry.mime.as_deref())?;
        let (tx, rx) = mpsc::channel(16);
        source.set_event_listener(tx);
        source.run().await?;
        self.source = Some(source);
        self.current = Some(entry.clone());
        Ok(rx)
    }

    async fn handle_event(&mut self, event: SourceEvent, es_index: &mut usize) {
        match event {
            SourceEvent::NewEs { pid, mime, latency } => {
                let Some(source) = &self.source else {
                    tracing::warn!("player: event without source");
                    return;
                };
                if *es_index >= self.outstreams.len() {
                    tracing::warn!("player: no free output for stream {}, ignoring", pid);
                    source.attach(pid, None).await;
                    return;
                }
                let outstream = &self.outstreams[*es_index];
                let Some(mut decoder) = ondecodec::build_decoder(&mime) else {
                    tracing::warn!("player: decoder not found for {}", mime);
                    source.attach(pid, None).await;
                    return;
                };
                let filter = match FilterChain::new(outstream.format()) {
                    Ok(filter) => filter,
                    Err(err) => {
                        tracing::warn!("player: filter chain: {}", err);
                        source.attach(pid, None).await;
                        return;
                    }
                };
                let info = self
                    .current
                    .as_ref()
                    .map(|entry| entry.info.clone())
                    .unwrap_or_default();
                let mut filter = match info.replaygain() {
                    Some(db) => filter.with_replaygain(db),
                    None => filter,
                };
                if self.stats_filter {
                    filter = filter.with_stats();
                }
                decoder.prepare(filter, info.duration());
                let profile = match latency {
                    EsLatency::Low => JitterProfile::Low,
                    EsLatency::Mid => JitterProfile::Mid,
                    EsLatency::High => JitterProfile::High,
                };
                let input = decoder.input_jitter(profile).await;
                source.attach(pid, Some(input)).await;
                self.decoders
                    .lock()
                    .await
                    .push((pid, decoder, *es_index));
                *es_index += 1;
            }
            SourceEvent::DecodeEs { pid } => {
                let transport: Arc<dyn Transport> = Arc::new(PlayerTransport {
                    shared: self.shared.clone(),
                });
                let mut decoders = self.decoders.lock().await;
                if let Some((_, decoder, index)) =
                    decoders.iter_mut().find(|(p, _, _)| *p == pid)
                {
                    let out = self.outstreams[*index].clone();
                    if let Err(err) = decoder.run(transport, out).await {
                        tracing::warn!("player: decoder start failed: {}", err);
                    }
                }
            }
            SourceEvent::EndEs { pid } => {
                tracing::debug!("player: end of stream {}", pid);
            }
        }
    }

    async fn teardown(&mut self, events: &mut Option<mpsc::Receiver<SourceEvent>>) {
        if let Some(mut source) = self.source.take() {
            source.shutdown().await;
        }
        let mut decoders = self.decoders.lock().await;
        for (_, mut decoder, _) in decoders.drain(..) {
            decoder.shutdown().await;
        }
        drop(decoders);
        *events = None;
        self.current = None;
    }
}

/// `recv` sur un canal optionnel : en l'absence de source, attend
/// indéfiniment (la transition viendra de l'état).
async fn recv_event(events: &mut Option<mpsc::Receiver<SourceEvent>>) -> Option<SourceEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Vue du player donnée aux décodeurs : barrière de pause et fin de
/// piste.
struct PlayerTransport {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl Transport for PlayerTransport {
    async fn writable(&self) -> bool {
        let mut rx = self.shared.state_tx.subscribe();
        let state = match rx.wait_for(|state| *state != State::Pause).await {
            Ok(state) => *state,
            Err(_) => return false,
        };
        !matches!(state, State::Change | State::Error)
    }

    fn track_done(&self) {
        // Une fin de piste ne compte que pendant la lecture : après un
        // arrêt, le décodeur finit dans le vide.
        if self.shared.state() == State::Play {
            self.shared.state_tx.send_replace(State::Change);
        }
    }
}

/// Poignée clonable sur le player, utilisée par le plan de contrôle.
#[derive(Clone)]
pub struct PlayerHandle {
    shared: Arc<Shared>,
    media: SharedMedia,
    decoders: Arc<Mutex<Vec<DecoderSlot>>>,
}

impl PlayerHandle {
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Demande une transition ; retourne l'état cible, ou `Err` avec
    /// l'état courant quand la demande n'a pas de sens.
    pub fn request(&self, want: State) -> std::result::Result<State, State> {
        let current = self.state();
        match requested_transition(current, want) {
            Some(target) => {
                self.shared.state_tx.send_replace(target);
                Ok(target)
            }
            None => Err(current),
        }
    }

    /// Saute à l'entrée suivante de la liste.
    pub fn next(&self) -> State {
        let current = self.state();
        if matches!(current, State::Play | State::Pause) {
            self.shared.state_tx.send_replace(State::Change);
            State::Change
        } else {
            current
        }
    }

    pub fn current_id(&self) -> Option<i64> {
        self.shared.current_id()
    }

    /// Défaillance fatale : démonte la piste courante et termine la
    /// boucle principale.
    pub fn terminate(&self) {
        self.shared.state_tx.send_replace(State::Error);
    }

    /// Flux de notifications : état courant et piste courante.
    pub fn onchange(&self) -> watch::Receiver<TrackChange> {
        self.shared.change_tx.subscribe()
    }

    /// Position et durée (secondes) de la piste courante.
    pub async fn position(&self) -> (f64, Option<f64>) {
        let decoders = self.decoders.lock().await;
        match decoders.first() {
            Some((_, decoder, _)) => (decoder.position_secs(), decoder.duration_secs()),
            None => (0.0, None),
        }
    }

    /// Le curseur de média partagé.
    pub fn media(&self) -> SharedMedia {
        self.media.clone()
    }

    /// Remplace le média courant (commande `change`).
    pub fn set_media(&self, media: Box<dyn Media>) {
        if let Ok(mut current) = self.media.lock() {
            *current = media;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaInfo, MediaOptions, SingleMedia};
    use ondeaudio::{SampleFormat, ScatterJitter};
    use std::io::Write;
    use std::time::Duration;

    fn pcm_media(bytes: usize) -> (tempfile::NamedTempFile, Box<dyn Media>) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let samples: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&samples).unwrap();
        let url = format!("file://{}", tmp.path().display());
        let media = SingleMedia::new(&url, Some("audio/pcm"), MediaInfo::default());
        (tmp, Box::new(media))
    }

    #[tokio::test]
    async fn test_stop_then_query_returns_stop() {
        let (_tmp, media) = pcm_media(256);
        let mut player = Player::new(media);
        player.subscribe_output(Jitter::Scatter(
            ScatterJitter::new("out", 8, 1024).with_format(SampleFormat::Pcm16LeStereo),
        ));
        let handle = player.handle();
        let _runner = tokio::spawn(async move { player.run().await });

        let _ = handle.request(State::Stop);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), State::Stop);
    }

    #[tokio::test]
    async fn test_refused_requests_report_current_state() {
        let (_tmp, media) = pcm_media(64);
        let player = Player::new(media);
        let handle = player.handle();
        // Pause sans lecture : refusé, l'état courant est retourné.
        assert_eq!(handle.request(State::Pause), Err(State::Stop));
    }

    #[tokio::test]
    async fn test_play_single_track_then_stop() {
        let (_tmp, media) = pcm_media(4096);
        let mut player = Player::new(media);
        let out = Jitter::Scatter(
            ScatterJitter::new("out", 8, 1024).with_format(SampleFormat::Pcm16LeStereo),
        );
        player.subscribe_output(out.clone());
        let handle = player.handle();
        let mut changes = handle.onchange();
        let _runner = tokio::spawn(async move { player.run().await });

        assert_eq!(handle.request(State::Play), Ok(State::Change));

        // La piste démarre : on observe Play avec un id.
        let observed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                changes.changed().await.unwrap();
                let change = *changes.borrow();
                if change.state == State::Play {
                    return change;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(observed.media_id, Some(0));

        // On draine la sortie jusqu'à la fin de piste.
        let collected = tokio::time::timeout(Duration::from_secs(5), async {
            let mut total = 0usize;
            loop {
                match out.peer().await {
                    Some(peered) => {
                        total += peered.len();
                        let len = peered.len();
                        out.pop(peered, len).await;
                    }
                    None => return total,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(collected, 4096);

        // Liste épuisée, sans boucle : retour à l'arrêt.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handle.state() == State::Stop {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_pause_blocks_decoder_writes() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let (_tmp, media) = pcm_media(65_536);
        let mut player = Player::new(media);
        let out = Jitter::Scatter(
            ScatterJitter::new("out", 8, 1024).with_format(SampleFormat::Pcm16LeStereo),
        );
        player.subscribe_output(out.clone());
        let handle = player.handle();
        let _runner = tokio::spawn(async move { player.run().await });

        // Consommateur lent : la piste dure assez longtemps pour mettre
        // la pause en plein décodage.
        let progress = Arc::new(AtomicUsize::new(0));
        let consumer = {
            let out = out.clone();
            let progress = progress.clone();
            tokio::spawn(async move {
                loop {
                    match out.peer().await {
                        Some(peered) => {
                            progress.fetch_add(peered.len(), Ordering::AcqRel);
                            let len = peered.len();
                            out.pop(peered, len).await;
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        None => break,
                    }
                }
            })
        };

        let _ = handle.request(State::Play);
        tokio::time::timeout(Duration::from_secs(5), async {
            while progress.load(Ordering::Acquire) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(handle.request(State::Pause), Ok(State::Pause));
        // Le jitter de sortie se vide puis plus rien ne bouge : le
        // décodeur est bloqué avant chaque push.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stalled = progress.load(Ordering::Acquire);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(progress.load(Ordering::Acquire), stalled);
        assert!(stalled < 65_536);

        // La reprise mène la piste à son terme.
        assert_eq!(handle.request(State::Play), Ok(State::Play));
        tokio::time::timeout(Duration::from_secs(10), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.load(Ordering::Acquire), 65_536);
    }

    /// Liste en mémoire à plusieurs entrées, pour les tests d'enchaînement.
    struct VecMedia {
        entries: Vec<MediaEntry>,
        position: Option<usize>,
        options: MediaOptions,
    }

    impl VecMedia {
        fn new(entries: Vec<MediaEntry>) -> Self {
            Self {
                entries,
                position: None,
                options: MediaOptions::default(),
            }
        }
    }

    impl Media for VecMedia {
        fn count(&self) -> usize {
            self.entries.len()
        }

        fn next(&mut self) -> Option<MediaEntry> {
            let next = match self.position {
                None => 0,
                Some(position) => position + 1,
            };
            if next >= self.entries.len() {
                return None;
            }
            self.position = Some(next);
            self.entries.get(next).cloned()
        }

        fn current(&self) -> Option<MediaEntry> {
            self.entries.get(self.position?).cloned()
        }

        fn end(&mut self) {
            self.position = None;
        }

        fn find(&self, id: i64) -> Option<MediaEntry> {
            self.entries.iter().find(|entry| entry.id == id).cloned()
        }

        fn set_next(&mut self, _id: i64) -> bool {
            false
        }

        fn options(&self) -> MediaOptions {
            self.options
        }

        fn set_options(&mut self, options: MediaOptions) {
            self.options = options;
        }
    }

    #[tokio::test]
    async fn test_track_advance_plays_entries_in_order() {
        // Deux pistes PCM de tailles distinctes : la taille par segment
        // prouve l'ordre de lecture.
        let mut files = Vec::new();
        let mut entries = Vec::new();
        for (id, bytes) in [(7i64, 1024usize), (8, 2048)] {
            let mut tmp = tempfile::NamedTempFile::new().unwrap();
            tmp.write_all(&vec![0u8; bytes]).unwrap();
            entries.push(MediaEntry {
                id,
                url: format!("file://{}", tmp.path().display()),
                mime: Some("audio/pcm".to_string()),
                info: MediaInfo::default(),
            });
            files.push(tmp);
        }
        let mut player = Player::new(Box::new(VecMedia::new(entries)));
        let out = Jitter::Scatter(
            ScatterJitter::new("out", 8, 512).with_format(SampleFormat::Pcm16LeStereo),
        );
        player.subscribe_output(out.clone());
        let handle = player.handle();
        let _runner = tokio::spawn(async move { player.run().await });

        let _ = handle.request(State::Play);

        // Chaque fin de piste délivre un None : les octets par segment
        // suivent l'ordre de la liste.
        let segments = tokio::time::timeout(Duration::from_secs(10), async {
            let mut segments = Vec::new();
            let mut current = 0usize;
            while segments.len() < 2 {
                match out.peer().await {
                    Some(peered) => {
                        current += peered.len();
                        let len = peered.len();
                        out.pop(peered, len).await;
                    }
                    None => {
                        segments.push(current);
                        current = 0;
                    }
                }
            }
            segments
        })
        .await
        .unwrap();
        assert_eq!(segments, vec![1024, 2048]);

        // Liste épuisée : retour à l'arrêt, plus de piste courante.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handle.state() == State::Stop {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.current_id(), None);
    }

    #[tokio::test]
    async fn test_loop_option_replays_single_entry() {
        let (_tmp, mut media) = pcm_media(512);
        media.set_options(MediaOptions {
            loop_enabled: true,
            random: false,
        });
        let mut player = Player::new(media);
        let out = Jitter::Scatter(
            ScatterJitter::new("out", 8, 1024).with_format(SampleFormat::Pcm16LeStereo),
        );
        player.subscribe_output(out.clone());
        let handle = player.handle();
        let _runner = tokio::spawn(async move { player.run().await });

        let _ = handle.request(State::Play);
        // Deux fins de piste consécutives : la même entrée rejoue.
        let replays = tokio::time::timeout(Duration::from_secs(10), async {
            let mut eos = 0;
            while eos < 2 {
                match out.peer().await {
                    Some(peered) => {
                        let len = peered.len();
                        out.pop(peered, len).await;
                    }
                    None => eos += 1,
                }
            }
            eos
        })
        .await
        .unwrap();
        assert_eq!(replays, 2);
        let _ = handle.request(State::Stop);
    }
}
