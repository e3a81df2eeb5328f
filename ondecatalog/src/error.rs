//! Types d'erreurs pour ondecatalog.

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("media not found: {0}")]
    NotFound(i64),
    #[error("catalog lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, CatalogError>;
