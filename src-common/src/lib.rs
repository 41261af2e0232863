//! framecap common library
//!
//! Shared types, configuration and log locations used by the capture core and
//! the command-line host.

pub mod config;
pub mod logging;
pub mod types;
pub mod validation;

pub use types::*;
