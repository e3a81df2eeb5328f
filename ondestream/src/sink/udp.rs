//! Sink UDP/RTP : un datagramme par trame du jitter.
//!
//! L'interface de sortie se choisit par `?if=NAME`, le TTL multicast est
//! posé et les adresses de classe D rejoignent leur groupe. Le battement
//! posé par l'encodeur cadence l'émission.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ondeaudio::{Jitter, SampleFormat, ScatterJitter};
use ondeutils::interface_addr;
use ondeutils::media_url::MediaUrl;

use crate::error::{Result, StreamError};

const FRAMES: usize = 6;
const FRAME_BYTES: usize = 1500;
const MULTICAST_TTL: u32 = 2;

pub struct UdpSink {
    host: String,
    port: u16,
    iface: Option<String>,
    input: Option<Jitter>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpSink {
    pub fn new(url: &MediaUrl) -> Result<Self> {
        let host = url
            .host()
            .ok_or_else(|| StreamError::UnsupportedUrl(url.raw().to_string()))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| StreamError::UnsupportedUrl(url.raw().to_string()))?;
        Ok(Self {
            host,
            port,
            iface: url.query("if").map(str::to_string),
            input: None,
            stop: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    fn open_socket(&self, dest: Ipv4Addr) -> Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(StreamError::Io)?;
        let iface = self
            .iface
            .as_deref()
            .and_then(interface_addr)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(iface, 0));
        socket.bind(&bind_addr.into()).map_err(|err| StreamError::Open {
            target: format!("udp sink on {}", iface),
            details: err.to_string(),
        })?;
        if dest.is_multicast() {
            socket
                .set_multicast_ttl_v4(MULTICAST_TTL)
                .map_err(StreamError::Io)?;
            if iface != Ipv4Addr::UNSPECIFIED {
                socket.set_multicast_if_v4(&iface).map_err(StreamError::Io)?;
            }
        }
        socket.set_nonblocking(true).map_err(StreamError::Io)?;
        Ok(socket.into())
    }
}

#[async_trait::async_trait]
impl super::Sink for UdpSink {
    async fn jitter(&mut self) -> Jitter {
        match &self.input {
            Some(input) => input.clone(),
            None => {
                let jitter = Jitter::Scatter(
                    ScatterJitter::new("udp sink", FRAMES, FRAME_BYTES)
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
        let dest_ip: Ipv4Addr = self.host.parse().map_err(|_| StreamError::Open {
            target: self.host.clone(),
            details: "not an IPv4 address".into(),
        })?;
        let dest = SocketAddr::V4(SocketAddrV4::new(dest_ip, self.port));
        let socket = UdpSocket::from_std(self.open_socket(dest_ip)?).map_err(StreamError::Io)?;
        let stop = self.stop.clone();
        let task = tokio::spawn(async move {
            loop {
                // peer() attend le battement : l'émission suit l'horloge.
                let peered = tokio::select! {
                    _ = stop.cancelled() => break,
                    peered = input.peer() => peered,
                };
                match peered {
                    Some(peered) => {
                        if let Err(err) = socket.send_to(peered.data(), dest).await {
                            tracing::warn!("udp sink send failed: {}", err);
                        }
                        let len = peered.len();
                        input.pop(peered, len).await;
                    }
                    None => {
                        if input.is_closed().await {
                            break;
                        }
                        tracing::debug!("udp sink: end of track");
                    }
                }
            }
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
    async fn test_one_datagram_per_frame() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let url = MediaUrl::parse(&format!("udp://127.0.0.1:{}", port)).unwrap();
        let mut sink = UdpSink::new(&url).unwrap();
        let jitter = sink.jitter().await;
        sink.run().await.unwrap();

        for value in 0u8..3 {
            let mut frame = jitter.pull().await.unwrap();
            frame.data_mut()[..4].fill(value);
            jitter.push(frame, 4, None).await;
        }

        let mut buf = [0u8; 1500];
        for value in 0u8..3 {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], &[value; 4]);
        }
        sink.shutdown().await;
    }
}
