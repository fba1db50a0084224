//! Stream commands - association and the unpack, capture, copy and export workflows

use anyhow::{Context, Result};
use unpacker::ipc::{
  Client,
  stream::{
    AssociateParams, ExportImageParams, GetFileSystemParams, PrepareForCaptureParams, PrepareForCopyParams,
    PrepareForUnpackParams, StreamAck, UnpackImageParams,
  },
};

fn print_ack(verb: &str, ack: &StreamAck) {
  match &ack.status {
    Some(status) => println!("{}: {} ({})", verb, ack.stream, status.status),
    None => println!("{}: {}", verb, ack.stream),
  }
}

pub async fn cmd_associate(client: &Client, stream: &str, device_id: Option<&str>) -> Result<()> {
  let result = client
    .call(AssociateParams {
      stream: stream.to_string(),
      device_id: device_id.unwrap_or_default().to_string(),
    })
    .await
    .context("Failed to associate stream")?;
  println!("Stream {} uses device {}", result.stream, result.device_id);
  Ok(())
}

pub async fn cmd_prepare_unpack(client: &Client, stream: &str, skip_if_scanned: bool, do_not_wait: bool) -> Result<()> {
  let ack = client
    .call(PrepareForUnpackParams {
      stream: stream.to_string(),
      skip_if_scanned,
      do_not_wait,
    })
    .await
    .context("Failed to prepare for unpack")?;
  print_ack(if do_not_wait { "Scan queued" } else { "Scanned" }, &ack);
  Ok(())
}

pub async fn cmd_unpack(client: &Client, stream: &str, image_leaf: &str, json: bool) -> Result<()> {
  let report = client
    .call(UnpackImageParams {
      stream: stream.to_string(),
      image_leaf: image_leaf.to_string(),
    })
    .await
    .context("Failed to unpack image")?;

  if json {
    println!("{}", serde_json::to_string_pretty(&report)?);
    return Ok(());
  }

  println!("Unpacked {}", report.image_name);
  println!("Deleted:        {} files", report.deleted);
  println!(
    "Fetched:        {} objects ({} bytes)",
    report.fetched_objects, report.fetched_bytes
  );
  println!(
    "Updated:        {} created, {} linked, {} removed, {} metadata",
    report.update.created, report.update.linked, report.update.removed, report.update.metadata_updated
  );
  Ok(())
}

pub async fn cmd_prepare_capture(client: &Client, stream: &str) -> Result<()> {
  let ack = client
    .call(PrepareForCaptureParams {
      stream: stream.to_string(),
    })
    .await
    .context("Failed to prepare for capture")?;
  print_ack("Ready for capture", &ack);
  Ok(())
}

pub async fn cmd_prepare_copy(client: &Client, stream: &str) -> Result<()> {
  let ack = client
    .call(PrepareForCopyParams {
      stream: stream.to_string(),
    })
    .await
    .context("Failed to prepare for copy")?;
  print_ack("Ready for copy", &ack);
  Ok(())
}

pub async fn cmd_export(client: &Client, stream: &str, export_type: &str, destination: &str) -> Result<()> {
  let ack = client
    .call(ExportImageParams {
      stream: stream.to_string(),
      export_type: export_type.to_string(),
      destination: destination.to_string(),
    })
    .await
    .context("Failed to export image")?;
  print_ack("Exported", &ack);
  Ok(())
}

/// Print the last scanned tree of a stream
pub async fn cmd_filesystem(client: &Client, stream: &str, json: bool) -> Result<()> {
  let result = client
    .call(GetFileSystemParams {
      stream: stream.to_string(),
    })
    .await
    .context("Failed to get file system")?;

  let Some(file_system) = result.file_system else {
    println!("Stream {} has no scanned file system", result.stream);
    return Ok(());
  };

  if json {
    println!("{}", serde_json::to_string_pretty(&file_system)?);
  } else {
    println!(
      "{}: {} entries, {} data bytes, {} distinct objects",
      result.stream,
      file_system.len(),
      file_system.total_data_bytes(),
      file_system.hashes().len()
    );
  }
  Ok(())
}
