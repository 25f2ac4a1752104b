//! OAuth protocol constants
//!
//! Grant type URNs and request parameters shared by the device flow, the
//! registrar and the rotator. None of these are secrets.

/// Default authorization server base URL
pub const DEFAULT_AUTH_URL: &str = "https://auth.penfield.app";

/// RFC 8414 metadata path, appended to the authorization server base URL
pub const DISCOVERY_PATH: &str = "/.well-known/oauth-authorization-server";

/// RFC 8628 device code grant type
pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// RFC 6749 refresh grant type
pub const REFRESH_TOKEN_GRANT_TYPE: &str = "refresh_token";

/// Scopes requested at registration and device authorization.
/// `offline_access` is what makes the server issue a refresh token.
pub const SCOPES: &str = "read write offline_access";

/// Client name declared during dynamic client registration
pub const CLIENT_NAME: &str = "memory-agent";

/// Redirect URI declared during registration. The device flow never
/// redirects, but registration endpoints commonly require one.
pub const REGISTRATION_REDIRECT_URI: &str = "http://localhost:8080/callback";

/// Poll interval used when the device authorization response omits `interval`
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Amount added to the poll interval on every `slow_down` signal (RFC 8628 §3.5)
pub const SLOW_DOWN_INCREMENT_SECS: u64 = 5;
