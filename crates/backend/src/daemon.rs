//! Daemon lifecycle management.
//!
//! # Architecture
//!
//! ```text
//! Daemon (Supervisor)
//!   ├── Server (IPC listener, spawns connection tasks)
//!   └── Unpacker
//!         └── StreamRouter
//!               └── StreamActor (one per stream, spawned on demand)
//! ```
//!
//! # Lifecycle
//!
//! 1. Create master `CancellationToken`
//! 2. Build host collaborators and the image client
//! 3. Load the `Unpacker` from the durable state file
//! 4. Create `Server` with all dependencies
//! 5. Run server until cancelled (signal or shutdown request)
//! 6. Graceful shutdown: stop every stream actor

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  dirs,
  domain::config::Config,
  error::UnpackerError,
  host::Host,
  image::{HttpImageClient, ImageError},
  ipc::{Client, IpcError},
  server::{DaemonState, Server, ServerConfig},
  unpacker::Unpacker,
};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
  #[error(transparent)]
  Unpacker(#[from] UnpackerError),
  #[error("Image client error: {0}")]
  Image(#[from] ImageError),
  #[error("Server error: {0}")]
  Server(#[from] IpcError),
}

// ============================================================================
// Configuration
// ============================================================================

/// Daemon runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  /// Path to the Unix socket for IPC
  pub socket_path: PathBuf,
  /// Run in foreground mode (console logging)
  pub foreground: bool,
  pub config: Config,
}

impl RuntimeConfig {
  /// Load from `config_path`, or the user config when `None`
  pub fn load(config_path: Option<&Path>) -> Self {
    let config = Config::load(config_path);
    Self {
      socket_path: config.socket_path(),
      foreground: false,
      config,
    }
  }
}

/// The image unpacker daemon.
///
/// ```ignore
/// let daemon = Daemon::new(RuntimeConfig::load(None));
/// daemon.run().await?;
/// ```
pub struct Daemon {
  runtime_config: RuntimeConfig,
}

impl Daemon {
  pub fn new(runtime_config: RuntimeConfig) -> Self {
    Self { runtime_config }
  }

  /// Connect to an existing daemon, starting one if necessary.
  ///
  /// Spawns a background daemon when nothing is listening on the socket,
  /// then polls for it for up to five seconds.
  pub async fn connect_or_start(socket_path: &Path, config_path: Option<&Path>) -> Result<Client, IpcError> {
    if dirs::is_daemon_running(socket_path) {
      debug!("Daemon is already running, connecting...");
      return Client::connect_to(socket_path).await;
    }

    info!("Daemon is not running, starting in background...");
    let pid = Self::spawn_detached(config_path)?;
    debug!("Spawned daemon with PID {}", pid);

    let delay = Duration::from_millis(500);
    let max_attempts = 10;
    for attempt in 1..=max_attempts {
      tokio::time::sleep(delay).await;
      if let Ok(client) = Client::connect_to(socket_path).await {
        info!("Successfully connected to daemon");
        return Ok(client);
      }
      debug!("Waiting for daemon to start... (attempt {}/{})", attempt, max_attempts);
    }

    Err(IpcError::Connection("Failed to connect to daemon after startup".into()))
  }

  /// Re-execute the current binary as `daemon --background`.
  ///
  /// A fresh process gets its own Tokio runtime instead of forking this one.
  pub fn spawn_detached(config_path: Option<&Path>) -> std::io::Result<u32> {
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe()?;
    let mut command = Command::new(&exe);
    command.arg("daemon").arg("--background");
    if let Some(path) = config_path {
      command.arg("--config").arg(path);
    }

    let child = command
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn()?;

    let pid = child.id();
    info!("Spawned daemon process with PID {}", pid);
    Ok(pid)
  }

  /// Run the daemon until a signal or a shutdown request arrives.
  pub async fn run(self) -> Result<(), DaemonError> {
    let RuntimeConfig {
      socket_path,
      foreground,
      config,
    } = self.runtime_config;

    info!("Starting image unpacker daemon");
    info!("Socket: {:?}", socket_path);
    info!("State dir: {:?}", config.unpacker.state_dir);

    // Master cancellation token - propagates to all children
    let cancel = CancellationToken::new();

    let host = Host::system(&config);
    let images = Arc::new(HttpImageClient::new(&config.unpacker.image_server_url, &config.image)?);
    info!("Image server: {}", config.unpacker.image_server_url);

    let unpacker = Arc::new(Unpacker::load(config, host, images.clone(), images, cancel.child_token()).await?);

    let server = Server::new(ServerConfig {
      socket_path,
      unpacker: Arc::clone(&unpacker),
      daemon_state: Arc::new(DaemonState::new(foreground)),
      shutdown: cancel.clone(),
    });

    Self::watch_signals(cancel.clone());

    let result = server.run(cancel.child_token()).await;
    if let Err(e) = &result {
      error!("Server error: {}", e);
    }

    info!("Shutting down...");
    cancel.cancel();
    unpacker.shutdown().await;
    info!("Daemon shutdown complete");

    Ok(result?)
  }

  fn watch_signals(cancel: CancellationToken) {
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
      if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        return;
      }
      info!("Received ctrl-c, shutting down...");
      on_ctrl_c.cancel();
    });

    tokio::spawn(async move {
      let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
          warn!("Failed to listen for SIGTERM: {}", e);
          return;
        }
      };
      tokio::select! {
        _ = term.recv() => {
          info!("Received SIGTERM, shutting down...");
          cancel.cancel();
        }
        _ = cancel.cancelled() => {}
      }
    });
  }
}
