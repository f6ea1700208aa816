use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Credential not found: {id}")]
    NotFound { id: String },

    #[error("Token storage error: {0}")]
    Token(String),

    #[error("Token refresh failed: {0}")]
    Refresh(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;
