//! Source HTTP(S) : GET en streaming via reqwest.

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ondeaudio::Jitter;
use ondeutils::media_url::MediaUrl;
use ondeutils::mime;

use crate::error::Result;
use crate::event::{emit, EsLatency, EsRegistry, EventSender, SourceEvent};

use super::push_bytes;

pub struct HttpSource {
    url: String,
    mime_hint: Option<String>,
    listener: Option<EventSender>,
    registry: EsRegistry,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl HttpSource {
    pub fn new(url: &MediaUrl, mime_hint: Option<&str>) -> Self {
        Self {
            url: url.raw().to_string(),
            mime_hint: mime_hint
                .map(str::to_string)
                .or_else(|| url.mime_hint().map(str::to_string)),
            listener: None,
            registry: EsRegistry::new(),
            stop: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl super::Source for HttpSource {
    async fn mime(&self, index: usize) -> Option<String> {
        (index == 0).then(|| {
            self.mime_hint
                .clone()
                .unwrap_or_else(|| mime::OCTET_STREAM.to_string())
        })
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
        let url = self.url.clone();
        let mime_hint = self.mime_hint.clone();
        let listener = self.listener.clone();
        let registry = self.registry.clone();
        let stop = self.stop.clone();
        let task = tokio::spawn(async move {
            let response = match reqwest::get(&url).await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    tracing::warn!("http source {}: status {}", url, response.status());
                    emit(&listener, SourceEvent::EndEs { pid: 0 }).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!("http source {}: {}", url, err);
                    emit(&listener, SourceEvent::EndEs { pid: 0 }).await;
                    return;
                }
            };
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
            let es_mime = mime_hint
                .or(content_type)
                .or_else(|| mime::from_path(&url).map(str::to_string))
                .unwrap_or_else(|| mime::OCTET_STREAM.to_string());

            emit(
                &listener,
                SourceEvent::NewEs {
                    pid: 0,
                    mime: mime::canonical(&es_mime).to_string(),
                    latency: EsLatency::Mid,
                },
            )
            .await;
            let Some(jitter) = registry.wait(0).await else {
                tracing::warn!("no decoder for {}", url);
                emit(&listener, SourceEvent::EndEs { pid: 0 }).await;
                return;
            };
            emit(&listener, SourceEvent::DecodeEs { pid: 0 }).await;

            let mut stream = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    _ = stop.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        if !push_bytes(&jitter, &bytes).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!("http source {}: {}", url, err);
                        break;
                    }
                    None => break,
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
