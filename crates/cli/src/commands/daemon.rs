//! Daemon commands

use anyhow::{Context, Result};
use tracing::info;
use unpacker::{
  Daemon, RuntimeConfig,
  ipc::{Client, system::ShutdownParams},
};

/// Run the daemon in this process until it is stopped
pub async fn cmd_daemon(runtime: RuntimeConfig) -> Result<()> {
  info!(foreground = runtime.foreground, "Starting image unpacker daemon");
  Daemon::new(runtime).run().await.context("Failed to run daemon")?;
  Ok(())
}

/// Start a detached background daemon
pub fn cmd_daemon_spawn(runtime: &RuntimeConfig, config_path: Option<&std::path::Path>) -> Result<()> {
  if unpacker::dirs::is_daemon_running(&runtime.socket_path) {
    println!("Daemon already running on {}", runtime.socket_path.display());
    return Ok(());
  }
  let pid = Daemon::spawn_detached(config_path).context("Failed to spawn daemon")?;
  println!("Started daemon (PID {})", pid);
  Ok(())
}

/// Ask a running daemon to shut down
pub async fn cmd_stop(runtime: &RuntimeConfig) -> Result<()> {
  if !unpacker::dirs::is_daemon_running(&runtime.socket_path) {
    println!("Daemon is not running");
    return Ok(());
  }

  let client = Client::connect_to(&runtime.socket_path)
    .await
    .context("Failed to connect to daemon")?;
  let result = client.call(ShutdownParams).await.context("Failed to stop daemon")?;
  println!("{}", result.message);
  Ok(())
}
