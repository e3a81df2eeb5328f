//! OndePlayer - Machine de transport et composition du pipeline
//!
//! Le player itère un curseur de média ([`Media`]), construit pour
//! chaque piste la chaîne source → décodeur(s) → jitters de sortie, et
//! pilote les transitions :
//!
//! ```text
//! Stop ──play──► Change ──piste trouvée──► Play ◄──play/pause──► Pause
//!   ▲               │                        │
//!   └──curseur épuisé┘              fin de piste ──► Change
//! ```
//!
//! Les auditeurs (plan de contrôle) suivent l'état et la piste courante
//! par un canal `watch` ; chaque changement est rediffusé une fois.

mod error;
pub mod media;
mod player;
mod state;

pub use error::{PlayerError, Result};
pub use media::{Media, MediaEntry, MediaInfo, MediaOptions, SingleMedia};
pub use player::{Player, PlayerHandle, SharedMedia, TrackChange};
pub use state::State;
