use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INVARIANT: {0}")]
    Invariant(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("CANCELLED: {0}")]
    Cancelled(String),
    #[error("STORAGE: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
