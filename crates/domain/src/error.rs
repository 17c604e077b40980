/// Shared error type used across all SessionGrid crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("index {index}: {message}")]
    Index { index: String, message: String },

    #[error("unknown index: {0}")]
    UnknownIndex(String),

    #[error("session {0} already released")]
    SessionReleased(String),

    #[error("session {0} is invalid")]
    SessionInvalid(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for an index-manager failure.
    pub fn index(index: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Index {
            index: index.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
