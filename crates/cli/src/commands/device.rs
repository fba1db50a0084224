//! Device commands (add, remove)

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use unpacker::ipc::{
  Client,
  device::{AddDeviceParams, PrepareForAddDeviceParams, RemoveDeviceParams},
};

/// Register a newly plugged block device under `device_id`.
///
/// The daemon snapshots the visible devices first, then the operator plugs
/// in exactly one new device before confirming.
pub async fn cmd_add_device(client: &Client, device_id: &str, assume_plugged: bool) -> Result<()> {
  let prepared = client
    .call(PrepareForAddDeviceParams)
    .await
    .context("Failed to prepare for device add")?;

  if !assume_plugged {
    println!(
      "{} block devices visible. Plug in the new device, then press Enter.",
      prepared.visible_devices
    );
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
      .lock()
      .read_line(&mut line)
      .context("Failed to read confirmation")?;
  }

  let added = client
    .call(AddDeviceParams {
      device_id: device_id.to_string(),
    })
    .await
    .context("Failed to add device")?;

  println!(
    "Added {} as {} ({} bytes, root label {})",
    added.device_name, added.device_id, added.size_bytes, added.root_label
  );
  Ok(())
}

pub async fn cmd_remove_device(client: &Client, device_id: &str) -> Result<()> {
  let removed = client
    .call(RemoveDeviceParams {
      device_id: device_id.to_string(),
    })
    .await
    .context("Failed to remove device")?;
  println!("Removed device {}", removed.device_id);
  Ok(())
}
