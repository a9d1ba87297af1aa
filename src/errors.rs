use std::error::Error as StdError;
use thiserror::Error;

/// Result type alias for sender operations
pub type Result<T> = std::result::Result<T, SenderError>;

/// Errors that can occur while configuring the sender or pushing alerts
#[derive(Debug, Error)]
pub enum SenderError {
    /// A configured receiver URL could not be parsed
    #[error("Invalid receiver URL {url:?}: {source}")]
    InvalidUrl {
        /// The URL as configured
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// A configured receiver URL has no host to deliver to
    #[error("Receiver URL {0:?} has no host")]
    MissingHost(String),

    /// Failed to build HTTP client
    #[error("Failed to build HTTP client: {0}")]
    BuildHttpClient(#[source] reqwest::Error),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest_middleware::Error),

    /// Failed to serialize alerts
    #[error("Failed to serialize alerts: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Receiver returned an error response
    #[error("Receiver API error: HTTP {status} - {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error message from the receiver
        message: String,
    },

    /// Metrics could not be registered
    #[error("Failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    /// A discovery strategy failed to resolve its targets
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// The sender background loops are already running
    #[error("Sender is already running")]
    AlreadyRunning,

    /// The sender was started outside a Tokio runtime
    #[error("No Tokio runtime to run the sender on")]
    NoRuntime,

    /// The sender has been stopped
    #[error("Sender is closed")]
    Closed,
}

impl SenderError {
    /// Check if the error is retryable
    ///
    /// Returns `true` for:
    /// - Network/connection errors
    /// - Timeout errors
    /// - Server errors (5xx status codes)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(source) => {
                if let reqwest_middleware::Error::Reqwest(err) = source {
                    return err.is_connect() || err.is_timeout();
                }
                if let Some(reqwest_err) = StdError::source(source) {
                    if let Some(err) = reqwest_err.downcast_ref::<reqwest::Error>() {
                        return err.is_connect() || err.is_timeout();
                    }
                }
                false
            }
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
