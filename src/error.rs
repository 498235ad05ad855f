use reqwest::StatusCode;

// Custom error type for cache engine operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    UrlError(String),

    #[error("Server returned status code {0}")]
    StatusCode(StatusCode),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Failed to persist cache index: {0}")]
    PersistenceError(String),

    #[error("Download interrupted before completion: {0}")]
    Interrupted(String),
}

impl CacheError {
    /// Whether this error came from the transport layer (network, HTTP
    /// status, cancellation) as opposed to local storage.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CacheError::HttpError(_)
                | CacheError::UrlError(_)
                | CacheError::StatusCode(_)
                | CacheError::Cancelled
        )
    }
}
