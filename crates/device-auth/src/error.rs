//! Error types for OAuth authentication operations

/// Errors from discovery, registration, the device flow, token refresh and
/// credential persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport-level failure: connection refused, timeout, truncated body.
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("client registration failed: {0}")]
    Registration(String),

    #[error("device authorization failed: {0}")]
    DeviceAuthorization(String),

    #[error("authorization denied by user")]
    AuthorizationDenied,

    #[error("device code expired, start the login again")]
    DeviceCodeExpired,

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    /// The token endpoint answered with a non-success status.
    /// `code` is the OAuth `error` value, or `unexpected_response` when the
    /// body was not an OAuth error document.
    #[error("token endpoint rejected request ({status}): {message}")]
    TokenRejected {
        status: u16,
        code: String,
        message: String,
    },

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures, 5xx responses and the two OAuth codes that signal
    /// server-side trouble are transient. Everything the server decided about
    /// the request itself (`invalid_grant`, `invalid_client`, other 4xx) is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::TokenRejected { status, code, .. } => {
                *status >= 500 || code == "server_error" || code == "temporarily_unavailable"
            }
            _ => false,
        }
    }

    /// Whether the stored refresh token is dead and only a new login helps.
    pub fn requires_login(&self) -> bool {
        match self {
            Error::TokenRejected { status, code, .. } => {
                code == "invalid_grant" || *status == 401 || *status == 403
            }
            _ => false,
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
