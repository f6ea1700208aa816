use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("messages required")]
    MessagesRequired,

    #[error("invalid request: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, TranslateError>;
