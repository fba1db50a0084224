//! image-unpacker - unpack, capture and export OS images on attached block devices

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use unpacker::{Daemon, RuntimeConfig, ipc::Client};

mod commands;
mod logging;

use commands::{
  cmd_add_device, cmd_associate, cmd_daemon, cmd_daemon_spawn, cmd_export, cmd_filesystem, cmd_prepare_capture,
  cmd_prepare_copy, cmd_prepare_unpack, cmd_remove_device, cmd_status, cmd_stop, cmd_unpack,
};
use logging::{init_cli_logging, init_daemon_logging};

#[derive(Parser)]
#[command(name = "image-unpacker")]
#[command(about = "Unpack, capture and export OS images on attached block devices")]
#[command(after_help = "\
QUICK START:
  image-unpacker daemon --foreground       # Run the daemon
  image-unpacker add-device sdcard-1       # Register a device (two-phase)
  image-unpacker prepare-unpack base/os    # Scan the device for the stream
  image-unpacker unpack base/os v42        # Unpack base/os/v42 onto it")]
struct Cli {
  /// Config file (default: user config)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Daemon socket (default: from config, then runtime dir)
  #[arg(long, global = true)]
  socket: Option<PathBuf>,

  /// Output as JSON where supported
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Start the daemon
  Daemon {
    /// Run in this process with console logging
    #[arg(long, conflicts_with = "background")]
    foreground: bool,
    /// Run in this process with file logging (used when spawned)
    #[arg(long, hide = true)]
    background: bool,
  },
  /// Stop a running daemon
  Stop,
  /// Show daemon, device and stream status
  Status,
  /// Register a newly plugged block device
  #[command(after_help = "\
The daemon records the visible block devices, then waits for you to plug in
exactly one new device and press Enter.")]
  AddDevice {
    device_id: String,
    /// Skip the prompt; the device is already plugged in
    #[arg(long)]
    yes: bool,
  },
  /// Forget a device that no stream uses
  RemoveDevice { device_id: String },
  /// Assign a device to a stream (any unused device when omitted)
  Associate { stream: String, device_id: Option<String> },
  /// Mount and scan a stream's device before unpacking
  PrepareUnpack {
    stream: String,
    /// Keep an existing scan
    #[arg(long)]
    skip_if_scanned: bool,
    /// Return once the scan is queued
    #[arg(long)]
    no_wait: bool,
  },
  /// Unpack `<stream>/<image_leaf>` onto the stream's device
  Unpack { stream: String, image_leaf: String },
  /// Mount a stream's device for capture
  PrepareCapture { stream: String },
  /// Unmount a stream's device so it can be copied
  PrepareCopy { stream: String },
  /// Make a stream's device bootable and export it
  Export {
    stream: String,
    export_type: String,
    destination: String,
  },
  /// Show the last scanned file system of a stream
  Filesystem { stream: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let mut runtime = RuntimeConfig::load(cli.config.as_deref());
  if let Some(socket) = &cli.socket {
    runtime.socket_path = socket.clone();
  }

  // File logging for a background daemon, console for everything else
  let _guard = match &cli.command {
    Commands::Daemon { foreground, background } if *foreground || *background => {
      init_daemon_logging(*foreground, &runtime.config.daemon)
    }
    _ => {
      init_cli_logging();
      None
    }
  };

  let config_path = cli.config.as_deref();
  match cli.command {
    Commands::Daemon { foreground, background } => {
      if !foreground && !background {
        return cmd_daemon_spawn(&runtime, config_path);
      }
      runtime.foreground = foreground;
      cmd_daemon(runtime).await
    }
    Commands::Stop => cmd_stop(&runtime).await,
    Commands::Status => cmd_status(&connect(&runtime, config_path).await?, cli.json).await,
    Commands::AddDevice { device_id, yes } => {
      cmd_add_device(&connect(&runtime, config_path).await?, &device_id, yes).await
    }
    Commands::RemoveDevice { device_id } => cmd_remove_device(&connect(&runtime, config_path).await?, &device_id).await,
    Commands::Associate { stream, device_id } => {
      cmd_associate(&connect(&runtime, config_path).await?, &stream, device_id.as_deref()).await
    }
    Commands::PrepareUnpack {
      stream,
      skip_if_scanned,
      no_wait,
    } => cmd_prepare_unpack(&connect(&runtime, config_path).await?, &stream, skip_if_scanned, no_wait).await,
    Commands::Unpack { stream, image_leaf } => {
      cmd_unpack(&connect(&runtime, config_path).await?, &stream, &image_leaf, cli.json).await
    }
    Commands::PrepareCapture { stream } => cmd_prepare_capture(&connect(&runtime, config_path).await?, &stream).await,
    Commands::PrepareCopy { stream } => cmd_prepare_copy(&connect(&runtime, config_path).await?, &stream).await,
    Commands::Export {
      stream,
      export_type,
      destination,
    } => cmd_export(&connect(&runtime, config_path).await?, &stream, &export_type, &destination).await,
    Commands::Filesystem { stream } => cmd_filesystem(&connect(&runtime, config_path).await?, &stream, cli.json).await,
  }
}

async fn connect(runtime: &RuntimeConfig, config_path: Option<&std::path::Path>) -> Result<Client> {
  Daemon::connect_or_start(&runtime.socket_path, config_path)
    .await
    .context("Failed to connect to daemon")
}
