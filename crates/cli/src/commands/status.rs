//! Status command

use anyhow::{Context, Result};
use unpacker::ipc::{Client, system::StatusParams};

/// Show daemon, device and stream status
pub async fn cmd_status(client: &Client, json: bool) -> Result<()> {
  let status = client.call(StatusParams).await.context("Failed to get status")?;

  if json {
    println!("{}", serde_json::to_string_pretty(&status)?);
    return Ok(());
  }

  println!("Image Unpacker Status");
  println!("=====================\n");
  println!("Version:        {}", status.version);
  println!(
    "Mode:           {}",
    if status.foreground { "foreground" } else { "background" }
  );
  println!("Uptime:         {}", format_duration(status.uptime_seconds));
  println!(
    "Last activity:  {} ago",
    format_duration(status.unpacker.time_since_last_activity().as_secs())
  );

  println!("\n--- Devices ---");
  if status.unpacker.devices.is_empty() {
    println!("(none)");
  }
  for (id, device) in &status.unpacker.devices {
    println!(
      "{:<16} {:<10} {:>10}  {}",
      id,
      device.device_name,
      format_size(device.size_bytes),
      device.assigned_stream.as_deref().unwrap_or("-")
    );
  }

  println!("\n--- Streams ---");
  if status.unpacker.streams.is_empty() {
    println!("(none)");
  }
  for (name, stream) in &status.unpacker.streams {
    println!(
      "{:<32} {:<16} {:<12} {}",
      name,
      stream.status.to_string(),
      stream.assigned_device.as_deref().unwrap_or("-"),
      stream.boot_label.as_deref().unwrap_or("")
    );
  }

  Ok(())
}

fn format_duration(secs: u64) -> String {
  if secs < 60 {
    format!("{}s", secs)
  } else if secs < 3600 {
    format!("{}m {}s", secs / 60, secs % 60)
  } else {
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
  }
}

fn format_size(bytes: u64) -> String {
  const GIB: u64 = 1 << 30;
  const MIB: u64 = 1 << 20;
  if bytes >= GIB {
    format!("{:.1} GiB", bytes as f64 / GIB as f64)
  } else {
    format!("{:.1} MiB", bytes as f64 / MIB as f64)
  }
}
