//! Core types and abstractions for the Strata incremental parsing engine.
//!
//! This crate provides the error type, configuration, and structural record
//! types shared by the engine and the CLI.

pub mod config;
pub mod error;
pub mod id;
pub mod types;

pub use config::{Strategy, StrataConfig};
pub use error::{ErrorKind, Result, StrataError};
pub use id::TaskId;
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Strategy, StrataConfig};
    pub use crate::error::{ErrorKind, Result, StrataError};
    pub use crate::id::TaskId;
    pub use crate::types::*;
}
