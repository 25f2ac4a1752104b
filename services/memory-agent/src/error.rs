//! Service-specific error types

use thiserror::Error;

/// Memory API client errors.
///
/// Authentication failures pass through unchanged so their "run
/// `memory-agent login`" hint reaches the operator.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] token_session::Error),

    #[error("request timed out after {secs}s: {method} {path}")]
    Timeout {
        method: String,
        path: String,
        secs: u64,
    },

    #[error("API request failed: {0}")]
    Http(String),

    #[error("rate limit exceeded{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<u64> },

    #[error("API request failed: {status}{}", message_suffix(.message))]
    Status { status: u16, message: Option<String> },

    #[error("invalid API response: {0}")]
    Decode(String),
}

fn retry_hint(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!(", retry after {secs} seconds"),
        None => String::new(),
    }
}

fn message_suffix(message: &Option<String>) -> String {
    match message {
        Some(message) => format!(" - {message}"),
        None => String::new(),
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
