//! Types d'erreurs pour ondecontrol.

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("cannot bind control socket {path}: {details}")]
    Bind { path: String, details: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControlError>;
