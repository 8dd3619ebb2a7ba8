//! Error types for the DORA collector

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CollectorError>;

#[derive(Debug, Error)]
pub enum CollectorError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The event source answered with a non-success status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The event source refused the request until its quota resets
    #[error("Rate limited until {}", describe_reset(.reset_at))]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// Request did not complete in time
    #[error("Request timeout")]
    Timeout,

    /// An event was missing required data
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Generic error with message
    #[error("Error: {0}")]
    Other(String),
}

impl CollectorError {
    /// Whether a later attempt of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CollectorError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.is_request()
                    || err.status().is_some_and(|s| s.is_server_error())
            }
            CollectorError::Api { status, .. } => *status >= 500 || *status == 429,
            CollectorError::RateLimited { .. } | CollectorError::Timeout | CollectorError::Io(_) => {
                true
            }
            _ => false,
        }
    }
}

fn describe_reset(reset_at: &Option<DateTime<Utc>>) -> String {
    reset_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}
