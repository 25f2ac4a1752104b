//! Shared types for the memory-agent workspace
//!
//! `Secret` keeps bearer material out of logs; `Error` covers configuration
//! loading failures shared by every binary in the workspace.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
