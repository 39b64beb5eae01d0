//! Configuration management for the `capd` service.
//!
//! This module handles loading and saving configuration from disk,
//! including known coordinated sets and the timing used by the GATT
//! sub-clients.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{CapdError, Result};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub known_sets: Vec<KnownSet>,

   #[serde(default = "default_request_timeout")]
   pub request_timeout_ms: u64,

   #[serde(default = "default_state_poll_attempts")]
   pub state_poll_attempts: u32,

   #[serde(default = "default_state_poll_interval")]
   pub state_poll_interval_ms: u64,

   #[serde(default = "default_cache_handles")]
   pub cache_handles: bool,

   #[serde(default = "default_health_check_interval")]
   pub health_check_interval_sec: u64,
}

/// A coordinated set grouped automatically once all members are connected.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownSet {
   pub name: String,
   pub members: Vec<String>,
}

const fn default_request_timeout() -> u64 {
   10_000
}

const fn default_state_poll_attempts() -> u32 {
   20
}

const fn default_state_poll_interval() -> u64 {
   50
}

const fn default_cache_handles() -> bool {
   true
}

const fn default_health_check_interval() -> u64 {
   5
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_sets: vec![],
         request_timeout_ms: default_request_timeout(),
         state_poll_attempts: default_state_poll_attempts(),
         state_poll_interval_ms: default_state_poll_interval(),
         cache_handles: default_cache_handles(),
         health_check_interval_sec: default_health_check_interval(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(capd_home) = env::var("CAPD_HOME") {
         PathBuf::from(capd_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(CapdError::ConfigDirNotFound);
      };

      Ok(config_dir.join("capd").join("config.toml"))
   }

   pub const fn request_timeout(&self) -> Duration {
      Duration::from_millis(self.request_timeout_ms)
   }

   pub const fn state_poll_interval(&self) -> Duration {
      Duration::from_millis(self.state_poll_interval_ms)
   }

   pub const fn health_check_interval(&self) -> Duration {
      Duration::from_secs(self.health_check_interval_sec)
   }

   /// Returns the known set `address` belongs to, if any.
   pub fn known_set_of(&self, address: &str) -> Option<&KnownSet> {
      self
         .known_sets
         .iter()
         .find(|set| set.members.iter().any(|m| m.eq_ignore_ascii_case(address)))
   }
}
