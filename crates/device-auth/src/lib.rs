//! OAuth device authorization client library
//!
//! Provides authorization server discovery (RFC 8414), dynamic client
//! registration (RFC 7591), the device authorization grant (RFC 8628),
//! rotating token refresh (RFC 9700) and crash-safe credential storage.
//! This crate has no dependency on the agent binary and no background tasks;
//! scheduling and caching live in `token-session`.
//!
//! Credential flow:
//! 1. `discovery::discover()` fetches the server metadata
//! 2. `registration::resolve_client_id()` returns a configured id or registers one
//! 3. `device_flow::DeviceFlow::execute()` runs the user-facing handshake
//! 4. Credential stored via `credentials::CredentialStore::save()`
//! 5. `token::refresh_token()` rotates tokens before expiry
//! 6. Rotated tokens saved via `credentials::CredentialStore::save()` again

pub mod clock;
pub mod constants;
pub mod credentials;
pub mod device_flow;
pub mod discovery;
pub mod error;
pub mod registration;
pub mod token;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use constants::*;
pub use credentials::{Credential, CredentialStore};
pub use device_flow::{
    DeviceAuthorization, DeviceFlow, DeviceFlowResult, FlowState, PollResponse, Prompter,
    UrlOpener, VerificationPrompt, next_state,
};
pub use discovery::{DiscoveryDocument, discover};
pub use error::{Error, Result};
pub use registration::{ClientRegistration, register_client, resolve_client_id};
pub use token::{TokenResponse, refresh_token};
