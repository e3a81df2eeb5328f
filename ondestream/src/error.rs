//! Types d'erreurs pour ondestream.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Aucun adaptateur ne reconnaît ce schéma d'URL.
    #[error("no adapter for URL: {0}")]
    UnsupportedUrl(String),
    /// Le périphérique, fichier ou socket a refusé l'ouverture.
    #[error("open failed for {target}: {details}")]
    Open { target: String, details: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("malformed URL: {0}")]
    Url(#[from] ondeutils::UrlError),
}

pub type Result<T> = std::result::Result<T, StreamError>;
