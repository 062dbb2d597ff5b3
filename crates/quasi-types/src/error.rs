use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("Invalid activity: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Task {task} is actively claimed by {held_by}")]
    Conflict { task: String, held_by: String },

    #[error("Task {0} is already completed")]
    AlreadyDone(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BoardError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for BoardError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BoardError>;
