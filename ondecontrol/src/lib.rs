//! OndeControl - Plan de contrôle JSON-RPC du lecteur
//!
//! Un socket Unix, du JSON-RPC 2.0 délimité par fin de ligne : transport
//! (play/pause/stop/next), manipulation de la liste de lecture, options
//! (loop/random), volume, télémétrie de position, et notifications
//! `onchange` poussées à chaque changement d'état ou de piste.

mod error;
pub mod proto;
mod server;

pub use error::{ControlError, Result};
pub use server::ControlServer;
