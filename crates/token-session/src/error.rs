//! Error types for token session operations

/// Errors surfaced to callers that need an access token.
///
/// Every variant tells the operator how to recover.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("not authenticated: run `memory-agent login`")]
    NotAuthenticated,

    #[error("access token expired and no refresh token is stored: run `memory-agent login`")]
    TokenExpired,

    #[error("token refresh failed: {0}. Re-run `memory-agent login`")]
    RefreshFailed(String),
}

/// Result alias for token session operations.
pub type Result<T> = std::result::Result<T, Error>;
