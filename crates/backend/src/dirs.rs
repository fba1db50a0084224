use std::path::{Path, PathBuf};

/// Get the default socket path
pub fn default_socket_path() -> PathBuf {
  // Try XDG_RUNTIME_DIR first, fallback to /tmp
  if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
    PathBuf::from(runtime_dir).join("image-unpacker.sock")
  } else {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/image-unpacker-{}.sock", uid))
  }
}

/// Check if a daemon is accepting connections on `socket_path`.
pub fn is_daemon_running(socket_path: &Path) -> bool {
  std::os::unix::net::UnixStream::connect(socket_path).is_ok()
}

/// Get the default log directory
///
/// Respects the following environment variables (in order of precedence):
/// 1. XDG_STATE_HOME - standard XDG state home directory
/// 2. dirs::state_dir() - platform default
/// 3. dirs::data_local_dir() - for platforms without a state dir
pub fn default_log_dir() -> PathBuf {
  if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
    return PathBuf::from(xdg_state).join("image-unpacker");
  }

  dirs::state_dir()
    .or_else(dirs::data_local_dir)
    .unwrap_or_else(|| PathBuf::from("."))
    .join("image-unpacker")
}
