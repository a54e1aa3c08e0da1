//! Error types for the volume control core.
//!
//! Public operations report failure as `bool`/`Option`; these errors cover
//! configuration and the device actor plumbing.

use bluer::Address;
use thiserror::Error;

/// Main error type for the volume control core.
#[derive(Error, Debug)]
pub enum VcpError {
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Device inbox closed: {0}")]
   InboxClosed(Address),

   #[error("Device inbox full: {0}")]
   InboxFull(Address),
}

/// Convenience type alias for Results with `VcpError`.
pub type Result<T> = std::result::Result<T, VcpError>;
