//! Configuration management for the volume control core.
//!
//! Handles loading and saving the TOML configuration: connection timeout,
//! the platform audio stream that mirrors group volume, and actor queue
//! sizing.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   error::{Result, VcpError},
   stack::platform::StreamType,
};

/// Main configuration structure for the core.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   /// Budget for `Connecting`/`Disconnecting` before the state machine gives up.
   #[serde(default = "default_connection_timeout")]
   pub connection_timeout_ms: u64,

   /// Platform audio stream that tracks the group volume.
   #[serde(default)]
   pub audio_stream: StreamType,

   /// Capacity of each device actor's inbox.
   #[serde(default = "default_queue_depth")]
   pub device_queue_depth: usize,
}

const fn default_connection_timeout() -> u64 {
   30_000
}

const fn default_queue_depth() -> usize {
   1000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         connection_timeout_ms: default_connection_timeout(),
         audio_stream: StreamType::default(),
         device_queue_depth: default_queue_depth(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(Self::config_path()?)
   }

   /// Loads configuration from an explicit path, writing defaults when absent.
   pub fn load_from(path: PathBuf) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(&path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(Self::config_path()?)
   }

   pub fn save_to(&self, path: PathBuf) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(vcp_home) = env::var("VCP_HOME") {
         PathBuf::from(vcp_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(VcpError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("le-vcp").join("config.toml"))
   }

   pub const fn connection_timeout(&self) -> Duration {
      Duration::from_millis(self.connection_timeout_ms)
   }
}
