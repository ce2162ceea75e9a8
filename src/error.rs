use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Audit error: {0}")]
    Audit(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Polars error: {0}")]
    Polars(String),

    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<polars::error::PolarsError> for ChatError {
    fn from(err: polars::error::PolarsError) -> Self {
        ChatError::Polars(err.to_string())
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        ChatError::Sqlite(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
