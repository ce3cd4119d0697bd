//! # shellcraft-error
//!
//! Unified error handling for shellcraft.
//!
//! ## Design
//!
//! - **ErrorKind**: what went wrong (e.g. `SpawnFailed`, `InferenceFailed`)
//! - **ErrorStatus**: how to react (Permanent, Temporary, Persistent)
//! - **Context**: operation name plus key-value pairs for diagnosis
//! - **Source**: the wrapped underlying error, never leaked as a raw type
//!
//! ## Usage
//!
//! ```rust
//! use shellcraft_error::{Error, ErrorKind};
//!
//! fn spawn() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::SpawnFailed, "shell 'bash' not found")
//!         .with_operation("shell::execute")
//!         .with_context("shell", "bash"))
//! }
//! ```
//!
//! A command that exits non-zero is *not* an error anywhere in shellcraft;
//! only infrastructure problems (spawn, model transport, configuration) are.

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::ErrorKind;
pub use status::ErrorStatus;

/// Result type alias using the shellcraft Error
pub type Result<T> = std::result::Result<T, Error>;
