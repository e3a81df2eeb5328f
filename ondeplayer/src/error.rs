//! Types d'erreurs pour ondeplayer.

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("no output subscribed, nothing to play to")]
    NoOutput,
    #[error("stream error: {0}")]
    Stream(#[from] ondestream::StreamError),
    #[error("codec error: {0}")]
    Codec(#[from] ondecodec::CodecError),
    #[error("player state machine corrupted: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
