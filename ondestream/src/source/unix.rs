//! Source socket Unix : connexion à un flux diffusé par un autre lecteur.

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ondeaudio::Jitter;
use ondeutils::media_url::MediaUrl;
use ondeutils::mime;

use crate::error::Result;
use crate::event::{emit, EsLatency, EsRegistry, EventSender, SourceEvent};

use super::push_bytes;

const READ_CHUNK: usize = 4096;

pub struct UnixSource {
    path: String,
    mime: String,
    listener: Option<EventSender>,
    registry: EsRegistry,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl UnixSource {
    pub fn new(url: &MediaUrl, mime_hint: Option<&str>) -> Self {
        let mime = mime_hint
            .map(str::to_string)
            .or_else(|| url.mime_hint().map(str::to_string))
            .unwrap_or_else(|| mime::OCTET_STREAM.to_string());
        Self {
            path: url.path().to_string(),
            mime,
            listener: None,
            registry: EsRegistry::new(),
            stop: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl super::Source for UnixSource {
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
        let path = self.path.clone();
        let mime = self.mime.clone();
        let listener = self.listener.clone();
        let registry = self.registry.clone();
        let stop = self.stop.clone();
        let task = tokio::spawn(async move {
            let mut socket = match UnixStream::connect(&path).await {
                Ok(socket) => socket,
                Err(err) => {
                    tracing::warn!("unix source {}: {}", path, err);
                    emit(&listener, SourceEvent::EndEs { pid: 0 }).await;
                    return;
                }
            };
            emit(
                &listener,
                SourceEvent::NewEs {
                    pid: 0,
                    mime,
                    latency: EsLatency::High,
                },
            )
            .await;
            let Some(jitter) = registry.wait(0).await else {
                tracing::warn!("no decoder for unix://{}", path);
                emit(&listener, SourceEvent::EndEs { pid: 0 }).await;
                return;
            };
            emit(&listener, SourceEvent::DecodeEs { pid: 0 }).await;

            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let read = tokio::select! {
                    _ = stop.cancelled() => break,
                    read = socket.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if !push_bytes(&jitter, &buf[..n]).await {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!("unix source {}: {}", path, err);
                        break;
                    }
                }
            }
            jitter.complete().await;
            emit(&listener, SourceEvent::EndEs { pid: 0 }).await;
        });
        self.tasks.push(task);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.stop.cancel();
        self.registry.close();
        if let Some(jitter) = self.registry.get(0).await {
            jitter.reset().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
