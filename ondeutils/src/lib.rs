//! Utilitaires partagés par les crates OndePlay.
//!
//! - [`ip_utils`] : détection des adresses des interfaces réseau locales,
//!   utilisée pour sélectionner l'interface de sortie des flux UDP/RTP.
//! - [`media_url`] : analyse des URLs comprises par le lecteur
//!   (`file://`, `unix://`, `http(s)://`, `udp://`, `rtp://`, `db://`).

mod ip_utils;
pub mod media_url;
pub mod mime;

pub use ip_utils::{guess_local_ip, interface_addr};
pub use media_url::{MediaUrl, Scheme, UrlError};
