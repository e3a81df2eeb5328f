//! Sink socket Unix : un producteur, plusieurs clients.
//!
//! Le sink lie un socket de flux et diffuse chaque trame à tous les
//! clients connectés. Un client qui échoue à l'écriture est retiré ;
//! le pipeline, lui, ne s'arrête jamais pour un client.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ondeaudio::{Jitter, SampleFormat, ScatterJitter};
use ondeutils::media_url::MediaUrl;

use crate::error::{Result, StreamError};

const FRAMES: usize = 6;
const FRAME_BYTES: usize = 8 * 1024;

pub struct UnixSink {
    path: PathBuf,
    input: Option<Jitter>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl UnixSink {
    pub fn new(url: &MediaUrl) -> Self {
        Self {
            path: PathBuf::from(url.path()),
            input: None,
            stop: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl super::Sink for UnixSink {
    async fn jitter(&mut self) -> Jitter {
        match &self.input {
            Some(input) => input.clone(),
            None => {
                let jitter = Jitter::Scatter(
                    ScatterJitter::new("unix sink", FRAMES, FRAME_BYTES)
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
        // Un socket résiduel d'une exécution précédente bloque le bind.
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path).map_err(|err| StreamError::Open {
            target: self.path.display().to_string(),
            details: err.to_string(),
        })?;
        let clients: Arc<Mutex<Vec<UnixStream>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_clients = clients.clone();
        let accept_stop = self.stop.clone();
        let accept = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_stop.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, _)) => {
                        tracing::info!("unix sink: client connected");
                        accept_clients.lock().await.push(stream);
                    }
                    Err(err) => {
                        tracing::warn!("unix sink accept failed: {}", err);
                        break;
                    }
                }
            }
        });
        self.tasks.push(accept);

        let stop = self.stop.clone();
        let broadcast = tokio::spawn(async move {
            loop {
                let peered = tokio::select! {
                    _ = stop.cancelled() => break,
                    peered = input.peer() => peered,
                };
                match peered {
                    Some(peered) => {
                        let mut pool = clients.lock().await;
                        let mut alive = Vec::with_capacity(pool.len());
                        for mut client in pool.drain(..) {
                            match client.write_all(peered.data()).await {
                                Ok(()) => alive.push(client),
                                Err(err) => {
                                    tracing::info!("unix sink: client dropped ({})", err);
                                }
                            }
                        }
                        *pool = alive;
                        drop(pool);
                        let len = peered.len();
                        input.pop(peered, len).await;
                    }
                    None => {
                        if input.is_closed().await {
                            break;
                        }
                        tracing::debug!("unix sink: end of track");
                    }
                }
            }
        });
        self.tasks.push(broadcast);
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
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Sink;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_broadcasts_to_connected_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sock");
        let url = MediaUrl::parse(&format!("unix://{}", path.display())).unwrap();
        let mut sink = UnixSink::new(&url);
        let jitter = sink.jitter().await;
        sink.run().await.unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        // Laisse l'accept enregistrer le client avant la diffusion.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut frame = jitter.pull().await.unwrap();
        frame.data_mut()[..5].copy_from_slice(b"hello");
        jitter.push(frame, 5, None).await;

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        sink.shutdown().await;
    }
}
