//! Error types for Ringleader

/// Result type alias for Ringleader operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Ringleader
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// Invalid admission pattern
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
    /// Line protocol that yields no measurement token
    #[error("Malformed line protocol: no measurement token")]
    Malformed,
    /// Lookup against a ring with no members
    #[error("Hash ring is empty")]
    EmptyRing,
    /// Write for a database outside the configured allowlist
    #[error("Database not allowed: {0}")]
    DatabaseNotAllowed(String),
    /// Circle index out of range
    #[error("Unknown circle: {0}")]
    UnknownCircle(usize),
    /// Backend URL not present in the circle
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
    /// Non-success HTTP status from a backend
    #[error("Backend {url} returned status {status}")]
    BackendStatus { url: String, status: u16 },
    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
