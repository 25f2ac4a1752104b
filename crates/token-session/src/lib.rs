//! Long-lived token session for the memory agent
//!
//! Owns the in-memory credential cache and keeps it fresh. Two paths can
//! decide to refresh: the request path (`AuthService::get_access_token`) and
//! the background scheduler. Both go through one single-flight gate, so only
//! one refresh request is ever in flight per process.
//!
//! Session lifecycle:
//! 1. `AuthService::start()` loads the stored credential into the cache
//! 2. `RefreshScheduler::spawn()` ticks every interval, reloading from disk
//! 3. Tokens expiring within the buffer are rotated (with retry) and persisted
//! 4. Callers get a valid access token, or an error telling them to log in

pub mod error;
pub mod retry;
pub mod scheduler;
pub mod service;

pub use error::{Error, Result};
pub use retry::RetryPolicy;
pub use scheduler::{RefreshScheduler, TickOutcome, tick};
pub use service::{AuthService, RefreshTrigger, SessionStatus};
