//! Types d'erreurs pour ondeaudio.

/// Erreurs du pipeline audio.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("jitter {0} is shut down")]
    JitterClosed(String),
    #[error("frame length {len} exceeds jitter frame size {size}")]
    FrameOverflow { len: usize, size: usize },
    #[error("sample format {0:?} carries no PCM layout")]
    NotPcm(crate::SampleFormat),
    #[error("processing error: {0}")]
    Processing(String),
}

/// Type Result spécialisé pour ondeaudio.
pub type Result<T> = std::result::Result<T, AudioError>;
