use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Authentication failed: {details}")]
    AuthenticationFailed { details: String },

    #[error("Rate limited: {details}")]
    RateLimited { details: String },

    #[error("Server error (Status: {status_code}): {details}")]
    ServerError { status_code: u16, details: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Failed to parse response: {details}")]
    ResponseParsingError { details: String },

    #[error("Stream error: {details}")]
    StreamError { details: String },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ApiError {
    /// Transient upstream failures are retried before the stream starts;
    /// everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } => true,
            ApiError::ServerError { status_code, .. } => *status_code >= 500,
            ApiError::Network(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }
}
