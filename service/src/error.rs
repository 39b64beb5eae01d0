//! Error types for the `capd` service.
//!
//! Daemon-level failures (Bluetooth, D-Bus, I/O, configuration, handle cache,
//! wire decoding). Outcomes of orchestrated requests use
//! [`Failure`](crate::cap::status::Failure) and only end up here when a
//! daemon call needs to surface one.

use thiserror::Error;

use crate::{bluetooth::codec::CodecError, cap::status::Failure, handle_cache};

/// Main error type for the `capd` service.
#[derive(Error, Debug)]
pub enum CapdError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Handle cache error: {0}")]
   HandleCache(#[from] handle_cache::Error),

   #[error("Malformed payload: {0}")]
   Codec(#[from] CodecError),

   #[error("Request failed: {0}")]
   Request(#[from] Failure),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `CapdError`.
pub type Result<T> = std::result::Result<T, CapdError>;
