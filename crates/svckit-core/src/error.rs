use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Publish to '{topic}' failed after {attempts} attempt(s): {source}")]
    Publish {
        topic: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Handler for '{topic}' on queue '{queue}' failed: {message}")]
    Handler {
        queue: String,
        topic: String,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cache error: {0}")]
    Cache(String),
}

impl Error {
    /// Whether a retry loop may attempt the operation again.
    ///
    /// Only transport-level failures qualify. Configuration, codec and
    /// serialization failures would fail identically on every attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Transport(_))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
