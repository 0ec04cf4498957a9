//! Error types for creator-dl
//!
//! This module provides the error taxonomy for the download engine:
//! - Pre-flight errors (unsupported domain, malformed target URL)
//! - Transient network errors, classified for retry by [`crate::retry::IsRetryable`]
//! - Permanent fetch errors (4xx responses, malformed response bodies)
//! - Filesystem errors, fatal only for the single task that hit them

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for creator-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for creator-dl
///
/// Failures at the single-file or single-post granularity are caught and
/// recorded by the run controller; only [`Error::UnsupportedDomain`],
/// [`Error::InvalidTarget`] and total exhaustion of the creator-page retry
/// budget abort a whole run.
#[derive(Debug, Error)]
pub enum Error {
    /// The input URL's hostname is not in the supported domain table
    #[error("unsupported domain: {0}")]
    UnsupportedDomain(String),

    /// The input URL matched a supported domain but not a recognized
    /// creator or post path
    #[error("invalid target URL: {0}")]
    InvalidTarget(String),

    /// Network error (timeout, connection failure, protocol error)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success HTTP status from the aggregator
    #[error("HTTP {status} from {url}")]
    Http {
        /// The response status code
        status: u16,
        /// The request URL
        url: String,
    },

    /// Response body could not be parsed into the expected shape
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse {
        /// The request URL
        url: String,
        /// What was wrong with the body
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory creation or file move failed for a single task
    #[error("filesystem error at {path}: {reason}")]
    Filesystem {
        /// The path the operation targeted
        path: PathBuf,
        /// What failed
        reason: String,
    },

    /// Cancellation was requested; queued work is dropped
    #[error("cancellation requested")]
    Cancelled,

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "simultaneous_downloads")
        key: Option<String>,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True when the error is an HTTP rate-limit response (429)
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::Http { status: 429, .. })
    }
}
