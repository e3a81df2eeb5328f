//! Sink fichier : les trames sont écrites bout à bout.

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ondeaudio::{Jitter, SampleFormat, ScatterJitter};
use ondeutils::media_url::MediaUrl;

use crate::error::{Result, StreamError};

const FRAMES: usize = 4;
const FRAME_BYTES: usize = 16 * 1024;

pub struct FileSink {
    path: std::path::PathBuf,
    input: Option<Jitter>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl FileSink {
    pub fn new(url: &MediaUrl) -> Self {
        Self {
            path: url.file_path(),
            input: None,
            stop: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl super::Sink for FileSink {
    async fn jitter(&mut self) -> Jitter {
        match &self.input {
            Some(input) => input.clone(),
            None => {
                let jitter = Jitter::Scatter(
                    ScatterJitter::new("file sink", FRAMES, FRAME_BYTES)
                        .with_format(SampleFormat::Stream),
                );
                self.input = Some(jitter.clone());
                jitter
            }
        }
    }

    async fn run(&mut self) -> Result<()> {
        let input = match &self.input {
            Some(input) => input.clone(),
            None => self.jitter().await,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| StreamError::Open {
                target: self.path.display().to_string(),
                details: err.to_string(),
            })?;
        let stop = self.stop.clone();
        let path = self.path.clone();
        let task = tokio::spawn(async move {
            loop {
                let peered = tokio::select! {
                    _ = stop.cancelled() => break,
                    peered = input.peer_beat() => peered,
                };
                match peered {
                    Some(peered) => {
                        if let Err(err) = file.write_all(peered.data()).await {
                            tracing::warn!("file sink {}: {}", path.display(), err);
                            let len = peered.len();
                            input.pop(peered, len).await;
                            break;
                        }
                        let len = peered.len();
                        input.pop(peered, len).await;
                    }
                    None => {
                        if input.is_closed().await {
                            break;
                        }
                        if let Err(err) = file.flush().await {
                            tracing::warn!("file sink {}: {}", path.display(), err);
                        }
                    }
                }
            }
            let _ = file.flush().await;
        });
        self.tasks.push(task);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(input) = &self.input {
            input.close().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Sink;

    #[tokio::test]
    async fn test_frames_are_appended_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let url = MediaUrl::parse(&format!("file://{}", path.display())).unwrap();
        let mut sink = FileSink::new(&url);
        let jitter = sink.jitter().await;
        sink.run().await.unwrap();

        for value in 0u8..3 {
            let mut frame = jitter.pull().await.unwrap();
            frame.data_mut()[..2].fill(value);
            jitter.push(frame, 2, None).await;
        }
        jitter.complete().await;
        // Laisse la tâche d'écriture drainer puis vider le tampon.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        sink.shutdown().await;

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, vec![0, 0, 1, 1, 2, 2]);
    }
}
