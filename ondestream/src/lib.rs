//! OndeStream - Adaptateurs d'entrée/sortie du pipeline audio
//!
//! Les quatre familles d'étages qui touchent au monde extérieur :
//!
//! - **sources** : octets bruts depuis `file://`, `http(s)://`,
//!   `udp://`, `rtp://` ou `unix://` vers le jitter aval ;
//! - **demux** : du flux de datagrammes aux flux élémentaires
//!   (passe-plat ou RTP avec suivi de séquence) ;
//! - **mux** : emballage des trames encodées (passe-plat ou RTP) ;
//! - **sinks** : carte son locale (cpal), fichier, UDP/RTP multicast,
//!   socket Unix en diffusion.
//!
//! Le dispatch se fait sur le schéma d'URL, les événements de flux
//! élémentaire remontent au player par canal, et la table
//! d'attachements pid → décodeur fait le lien entre les deux.

pub mod demux;
mod error;
mod event;
pub mod mux;
pub mod rtp;
pub mod sink;
pub mod source;

pub use demux::{DemuxKind, DemuxStats};
pub use error::{Result, StreamError};
pub use event::{EsLatency, EventSender, SourceEvent};
pub use mux::{Mux, PassthroughMux, RtpMux};
pub use rtp::RtpHeader;
pub use sink::{build as build_sink, Output, Sink, Volume};
pub use source::{build as build_source, Source};
