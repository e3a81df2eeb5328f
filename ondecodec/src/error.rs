use std::io;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("codec initialization failed: {0}")]
    Init(String),
    #[error("no codec for MIME type {0}")]
    UnknownMime(String),
    #[error("internal channel closed unexpectedly")]
    ChannelClosed,
    #[error("{role} task failed: {details}")]
    TaskJoin { role: &'static str, details: String },
}

impl From<claxon::Error> for CodecError {
    fn from(err: claxon::Error) -> Self {
        CodecError::Decode(err.to_string())
    }
}

impl From<opus::Error> for CodecError {
    fn from(err: opus::Error) -> Self {
        CodecError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
