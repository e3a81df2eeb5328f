//! Événements émis par les sources vers le player.
//!
//! Une source publie un flux élémentaire (`NewEs`), attend que le player
//! y attache le jitter d'entrée d'un décodeur, puis annonce que le
//! décodage peut démarrer (`DecodeEs`). `EndEs` clôt le flux, exactement
//! une fois par pid.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

use ondeaudio::Jitter;

/// Classe de latence d'un flux élémentaire, traduite côté player en
/// profondeur de jitter du décodeur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsLatency {
    Low,
    Mid,
    High,
}

/// Événement de source, délivré sur le canal du listener.
#[derive(Debug)]
pub enum SourceEvent {
    /// Premier paquet d'un flux élémentaire : le player doit construire
    /// un décodeur et appeler `attach` avec son jitter d'entrée.
    NewEs {
        pid: u32,
        mime: String,
        latency: EsLatency,
    },
    /// L'attachement est en place : le décodage peut démarrer.
    DecodeEs { pid: u32 },
    /// Fin du flux élémentaire.
    EndEs { pid: u32 },
}

/// Canal du listener d'événements ; un seul abonné, le player, qui
/// rediffuse ensuite à ses propres auditeurs.
pub type EventSender = mpsc::Sender<SourceEvent>;

/// Table des attachements pid → jitter de décodeur, partagée entre la
/// tâche de la source et le player.
#[derive(Clone, Default)]
pub(crate) struct EsRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    entries: Mutex<HashMap<u32, Option<Jitter>>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl EsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre la réponse du player pour un pid ; `None` signifie
    /// qu'aucun décodeur n'est disponible et que le flux sera ignoré.
    pub async fn attach(&self, pid: u32, jitter: Option<Jitter>) {
        self.inner.entries.lock().await.insert(pid, jitter);
        self.inner.notify.notify_waiters();
    }

    /// Attend la réponse du player pour un pid. Retourne `None` aussi
    /// quand la source se démonte sans réponse.
    pub async fn wait(&self, pid: u32) -> Option<Jitter> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                if self
                    .inner
                    .closed
                    .load(std::sync::atomic::Ordering::Acquire)
                {
                    return None;
                }
                let entries = self.inner.entries.lock().await;
                if let Some(entry) = entries.get(&pid) {
                    return entry.clone();
                }
            }
            notified.as_mut().await;
        }
    }

    /// Débloque tout `wait` en cours lors du démontage.
    pub fn close(&self) {
        self.inner
            .closed
            .store(true, std::sync::atomic::Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Consultation sans attente.
    pub async fn get(&self, pid: u32) -> Option<Jitter> {
        self.inner.entries.lock().await.get(&pid).cloned().flatten()
    }

    pub async fn pids(&self) -> Vec<u32> {
        self.inner.entries.lock().await.keys().copied().collect()
    }
}

/// Émet un événement sans bloquer la tâche de la source si le player a
/// disparu.
pub(crate) async fn emit(listener: &Option<EventSender>, event: SourceEvent) {
    if let Some(tx) = listener {
        if tx.send(event).await.is_err() {
            tracing::debug!("event listener dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ondeaudio::ScatterJitter;

    #[tokio::test]
    async fn test_registry_wait_sees_later_attach() {
        let registry = EsRegistry::new();
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait(7).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        registry
            .attach(7, Some(Jitter::Scatter(ScatterJitter::new("es", 2, 8))))
            .await;
        assert!(waiter.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_registry_none_means_ignored() {
        let registry = EsRegistry::new();
        registry.attach(3, None).await;
        assert!(registry.wait(3).await.is_none());
        assert!(registry.get(3).await.is_none());
    }
}
