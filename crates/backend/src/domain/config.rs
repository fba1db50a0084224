//! Configuration for the image unpacker daemon.
//!
//! Config priority: explicit path > `CONFIG_DIR` > `XDG_CONFIG_HOME` > platform config dir.
//! A missing or unreadable file yields the defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Name of the checkpoint file inside the state directory
pub const STATE_FILE: &str = "state.json";
/// Directory under the state directory holding per-stream mount points
pub const MOUNT_DIR: &str = "mnt";
/// Reserved directory on every mounted stream filesystem
pub const RESERVED_DIR: &str = ".subd";
/// Object cache directory below the reserved directory
pub const OBJECTS_DIR: &str = "objects";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub unpacker: UnpackerConfig,
  pub image: ImageConfig,
  pub capture: CaptureConfig,
  pub export: ExportConfig,
  pub daemon: DaemonConfig,
}

// ============================================================================
// Unpacker Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnpackerConfig {
  /// Directory holding the checkpoint and the mount points
  pub state_dir: PathBuf,
  /// Base URL of the image server (images and objects)
  pub image_server_url: String,
  /// Filesystem type passed to mount
  pub filesystem_type: String,
}

impl Default for UnpackerConfig {
  fn default() -> Self {
    Self {
      state_dir: PathBuf::from("/var/lib/image-unpacker"),
      image_server_url: "http://localhost:6971".to_string(),
      filesystem_type: "ext4".to_string(),
    }
  }
}

impl UnpackerConfig {
  pub fn state_file(&self) -> PathBuf {
    self.state_dir.join(STATE_FILE)
  }

  pub fn mount_root(&self) -> PathBuf {
    self.state_dir.join(MOUNT_DIR)
  }
}

// ============================================================================
// Image Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
  /// First wait between image availability polls
  pub poll_initial_ms: u64,
  /// Added to the wait after every "not ready" answer
  pub poll_step_ms: u64,
  /// Upper bound on the wait between polls
  pub poll_max_ms: u64,
  /// Timeout for a whole image request, and the connect and read timeout
  /// for object downloads
  pub request_timeout_secs: u64,
}

impl Default for ImageConfig {
  fn default() -> Self {
    Self {
      poll_initial_ms: 1000,
      poll_step_ms: 1000,
      poll_max_ms: 10_000,
      request_timeout_secs: 60,
    }
  }
}

// ============================================================================
// Capture Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
  /// Tool run inside the mounted root to make it bootable
  pub make_bootable_tool: PathBuf,
  /// Kernel command line options handed to the tool
  pub kernel_options: String,
}

impl Default for CaptureConfig {
  fn default() -> Self {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    Self {
      make_bootable_tool: home.join("etc").join("make-bootable"),
      kernel_options: "net.ifnames=0".to_string(),
    }
  }
}

// ============================================================================
// Export Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
  pub tool: PathBuf,
  /// Unprivileged user the export tool runs as
  pub username: String,
}

impl Default for ExportConfig {
  fn default() -> Self {
    Self {
      tool: PathBuf::from("/usr/local/etc/export-image"),
      username: "nobody".to_string(),
    }
  }
}

// ============================================================================
// Daemon Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
  /// Unix socket for IPC; defaults to the runtime directory
  #[serde(default)]
  pub socket_path: Option<PathBuf>,

  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  #[serde(default = "default_log_level")]
  pub log_level: String,

  /// Log file rotation: "daily", "hourly", "never"
  /// Default: "daily"
  #[serde(default = "default_log_rotation")]
  pub log_rotation: String,
}

fn default_log_level() -> String {
  "info".to_string()
}
fn default_log_rotation() -> String {
  "daily".to_string()
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      socket_path: None,
      log_level: default_log_level(),
      log_rotation: default_log_rotation(),
    }
  }
}

impl Config {
  /// Load from an explicit path, falling back to the user config
  pub fn load(path: Option<&Path>) -> Self {
    match path {
      Some(path) => Self::load_file(path).unwrap_or_default(),
      None => Self::load_global(),
    }
  }

  /// Load the user-level config, or defaults
  pub fn load_global() -> Self {
    Self::user_config_path()
      .filter(|path| path.exists())
      .and_then(|path| Self::load_file(&path))
      .unwrap_or_default()
  }

  fn load_file(path: &Path) -> Option<Self> {
    let content = match std::fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Failed to read config, using defaults");
        return None;
      }
    };
    match toml::from_str(&content) {
      Ok(config) => Some(config),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
        None
      }
    }
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("image-unpacker").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("image-unpacker").join("config.toml"))
  }

  pub fn socket_path(&self) -> PathBuf {
    self
      .daemon
      .socket_path
      .clone()
      .unwrap_or_else(crate::dirs::default_socket_path)
  }
}
