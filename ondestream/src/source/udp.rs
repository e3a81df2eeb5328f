//! Source UDP/RTP : datagrammes vers le demux embarqué.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ondeaudio::Jitter;
use ondeutils::media_url::MediaUrl;
use ondeutils::{interface_addr, mime};

use crate::demux::{self, DemuxConfig, DemuxKind, DemuxStats, DATAGRAM_SIZE};
use crate::error::{Result, StreamError};
use crate::event::{EsLatency, EsRegistry, EventSender};

pub struct UdpSource {
    host: String,
    port: u16,
    iface: Option<String>,
    kind: DemuxKind,
    config: DemuxConfig,
    listener: Option<EventSender>,
    registry: EsRegistry,
    stats: DemuxStats,
    input: Option<Jitter>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpSource {
    pub fn new(url: &MediaUrl, mime_hint: Option<&str>, kind: DemuxKind) -> Result<Self> {
        let host = url
            .host()
            .ok_or_else(|| StreamError::UnsupportedUrl(url.raw().to_string()))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| StreamError::UnsupportedUrl(url.raw().to_string()))?;
        let extra_pt = url.query("pt").and_then(|raw| raw.parse::<u8>().ok()).map(|pt| {
            let es_mime = url
                .mime_hint()
                .map(str::to_string)
                .unwrap_or_else(|| mime::OCTET_STREAM.to_string());
            (pt, es_mime)
        });
        let config = DemuxConfig {
            mime_hint: mime_hint
                .map(str::to_string)
                .or_else(|| url.mime_hint().map(str::to_string)),
            extra_pt,
        };
        Ok(Self {
            host,
            port,
            iface: url.query("if").map(str::to_string),
            kind,
            config,
            listener: None,
            registry: EsRegistry::new(),
            stats: DemuxStats::default(),
            input: None,
            stop: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Compteurs du demux (paquets manquants).
    pub fn stats(&self) -> DemuxStats {
        self.stats.clone()
    }

    fn open_socket(&self) -> Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(StreamError::Io)?;
        socket.set_reuse_address(true).map_err(StreamError::Io)?;
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port));
        socket.bind(&bind_addr.into()).map_err(|err| StreamError::Open {
            target: format!("udp://{}:{}", self.host, self.port),
            details: err.to_string(),
        })?;
        if let Ok(group) = self.host.parse::<Ipv4Addr>() {
            if group.is_multicast() {
                let iface = self
                    .iface
                    .as_deref()
                    .and_then(interface_addr)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                socket
                    .join_multicast_v4(&group, &iface)
                    .map_err(|err| StreamError::Open {
                        target: format!("multicast {}", group),
                        details: err.to_string(),
                    })?;
                tracing::info!("udp source: joined multicast {} on {}", group, iface);
            }
        }
        socket.set_nonblocking(true).map_err(StreamError::Io)?;
        Ok(socket.into())
    }
}

#[async_trait::async_trait]
impl super::Source for UdpSource {
    async fn mime(&self, index: usize) -> Option<String> {
        let pids = self.registry.pids().await;
        if index < pids.len() {
            self.config.mime_hint.clone()
        } else {
            None
        }
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
        let socket = UdpSocket::from_std(self.open_socket()?).map_err(StreamError::Io)?;
        let input = demux::input_jitter(EsLatency::High);
        self.input = Some(input.clone());

        // Réception : un datagramme par trame du jitter du demux.
        let recv_input = input.clone();
        let stop = self.stop.clone();
        let recv = tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_SIZE];
            loop {
                let received = tokio::select! {
                    _ = stop.cancelled() => break,
                    received = socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((len, _peer)) => {
                        let Some(mut frame) = recv_input.pull().await else {
                            break;
                        };
                        let n = len.min(frame.size());
                        frame.data_mut()[..n].copy_from_slice(&buf[..n]);
                        recv_input.push(frame, n, None).await;
                    }
                    Err(err) => {
                        tracing::warn!("udp source receive failed: {}", err);
                        break;
                    }
                }
            }
            recv_input.complete().await;
        });
        self.tasks.push(recv);

        let listener = self.listener.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();
        let stats = self.stats.clone();
        let kind = self.kind;
        let demux_task = tokio::spawn(async move {
            match kind {
                DemuxKind::Passthrough => {
                    demux::run_passthrough(input, listener, registry, config).await
                }
                DemuxKind::Rtp => {
                    demux::rtp::run(input, listener, registry, config, stats).await
                }
            }
        });
        self.tasks.push(demux_task);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.stop.cancel();
        self.registry.close();
        if let Some(input) = &self.input {
            input.close().await;
        }
        for pid in self.registry.pids().await {
            if let Some(jitter) = self.registry.get(pid).await {
                jitter.reset().await;
            }
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
