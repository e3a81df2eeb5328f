//! Source fichier local, en mode pull.
//!
//! Le fichier n'a pas besoin de tâche de production : un producteur est
//! installé sur le jitter d'entrée du décodeur, qui lit le fichier en
//! ligne au rythme de sa consommation.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ondeaudio::{Jitter, Produce};
use ondeutils::media_url::MediaUrl;
use ondeutils::mime;

use crate::error::{Result, StreamError};
use crate::event::{emit, EsLatency, EsRegistry, EventSender, SourceEvent};

struct FileProducer {
    file: File,
    /// Signale la fin de fichier à la tâche d'orchestration.
    done: mpsc::UnboundedSender<()>,
    finished: bool,
}

impl Produce for FileProducer {
    fn produce(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.file.read(buf)?;
        if n == 0 && !self.finished {
            self.finished = true;
            let _ = self.done.send(());
        }
        Ok(n)
    }
}

pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    mime: String,
    listener: Option<EventSender>,
    registry: EsRegistry,
    tasks: Vec<JoinHandle<()>>,
}

impl FileSource {
    pub fn new(url: &MediaUrl, mime_hint: Option<&str>) -> Result<Self> {
        let path = url.file_path();
        let file = File::open(&path).map_err(|err| StreamError::Open {
            target: path.display().to_string(),
            details: err.to_string(),
        })?;
        let mime = mime_hint
            .map(str::to_string)
            .or_else(|| url.mime_hint().map(str::to_string))
            .or_else(|| mime::from_path(&path.to_string_lossy()).map(str::to_string))
            .unwrap_or_else(|| mime::OCTET_STREAM.to_string());
        Ok(Self {
            path,
            file: Some(file),
            mime,
            listener: None,
            registry: EsRegistry::new(),
            tasks: Vec::new(),
        })
    }
}

#[async_trait::async_trait]
impl super::Source for FileSource {
    async fn mime(&self, index: usize) -> Option<String> {
        (index == 0).then(|| self.mime.clone())
    }

    fn set_event_listener(&mut self, tx: EventSender) {
        self.listener = Some(tx);
    }

    async fn attach(&self, pid: u32, input: Option<Jitter>) {
        self.registry.attach(pid, input).await;
    }

    async fn estream(&self, pid: u32) -> Option<Jitter> {
        self.registry.get(pid).await
    }

    async fn run(&mut self) -> Result<()> {
        let file = self.file.take().ok_or_else(|| StreamError::Open {
            target: self.path.display().to_string(),
            details: "source already running".into(),
        })?;
        let listener = self.listener.clone();
        let registry = self.registry.clone();
        let mime = self.mime.clone();
        let path = self.path.clone();
        let task = tokio::spawn(async move {
            emit(
                &listener,
                SourceEvent::NewEs {
                    pid: 0,
                    mime,
                    latency: EsLatency::Low,
                },
            )
            .await;
            let Some(jitter) = registry.wait(0).await else {
                tracing::warn!("no decoder for {}", path.display());
                emit(&listener, SourceEvent::EndEs { pid: 0 }).await;
                return;
            };
            let (done_tx, mut done_rx) = mpsc::unbounded_channel();
            jitter
                .install_producer(Box::new(FileProducer {
                    file,
                    done: done_tx,
                    finished: false,
                }))
                .await;
            emit(&listener, SourceEvent::DecodeEs { pid: 0 }).await;
            // La production est pilotée par le consommateur ; il ne reste
            // qu'à attendre la fin de fichier pour clore le flux.
            if done_rx.recv().await.is_some() {
                emit(&listener, SourceEvent::EndEs { pid: 0 }).await;
            }
        });
        self.tasks.push(task);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.registry.close();
        if let Some(jitter) = self.registry.get(0).await {
            jitter.reset().await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use ondeaudio::RingJitter;
    use std::io::Write;

    #[tokio::test]
    async fn test_file_source_feeds_decoder_jitter() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[42u8; 64]).unwrap();
        let url = MediaUrl::parse(&format!("file://{}", tmp.path().display())).unwrap();
        let mut source = FileSource::new(&url, Some("audio/pcm")).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        source.set_event_listener(tx);
        let input = Jitter::Ring(RingJitter::new("dec", 4, 32));

        let handle = {
            let input = input.clone();
            let source_registry = source.registry.clone();
            tokio::spawn(async move {
                source_registry.attach(0, Some(input)).await;
            })
        };
        source.run().await.unwrap();
        handle.await.unwrap();

        // NewEs puis DecodeEs.
        assert!(matches!(
            rx.recv().await,
            Some(SourceEvent::NewEs { pid: 0, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(SourceEvent::DecodeEs { pid: 0 })
        ));

        // Le consommateur tire : le producteur lit le fichier en ligne
        // jusqu'à la fin de flux.
        let mut collected = Vec::new();
        loop {
            let Some(peered) = input.peer().await else {
                break;
            };
            collected.extend_from_slice(peered.data());
            let len = peered.len();
            input.pop(peered, len).await;
        }
        assert_eq!(collected, vec![42u8; 64]);
        assert!(matches!(rx.recv().await, Some(SourceEvent::EndEs { pid: 0 })));
        source.shutdown().await;
    }

    #[test]
    fn test_missing_file_fails_open() {
        let url = MediaUrl::parse("file:///does/not/exist.mp3").unwrap();
        assert!(FileSource::new(&url, None).is_err());
    }
}
