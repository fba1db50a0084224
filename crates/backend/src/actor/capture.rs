//! Capture and copy workflows: make the stream's root bootable and release
//! the device.

use std::{path::Path, time::Instant};

use tracing::{debug, info};

use super::stream::StreamActor;
use crate::{
  domain::{
    config::RESERVED_DIR,
    device::Device,
    filesystem::{DirectoryInode, FileSystem, Inode, RegularInode},
    stream::{StreamOp, StreamStatus},
  },
  error::UnpackerError,
  host::{BootRequest, HostError},
};

impl StreamActor {
  /// Mount, clear debris, run the boot maker, then unmount and flush.
  /// Any failure leaves the stream `Mounted`.
  pub(super) async fn prepare_for_capture(&mut self) -> Result<(), UnpackerError> {
    self.status.check_busy(StreamOp::PrepareForCapture)?;
    let (_, device) = self.ensure_device().await?;
    self.mount(&device).await?;
    self.status.check_capture()?;

    self.set_status(StreamStatus::Preparing).await;
    let start = Instant::now();
    if let Err(e) = self.capture(&device).await {
      self.set_status(StreamStatus::Mounted).await;
      return Err(e);
    }
    self.clear_scan();
    self.set_status(StreamStatus::NotMounted).await;
    info!(
      stream = %self.name,
      elapsed_ms = start.elapsed().as_millis() as u64,
      "Prepared for capture"
    );
    Ok(())
  }

  async fn capture(&mut self, device: &Device) -> Result<(), UnpackerError> {
    let device_node = self.env.host.devices.device_node(&device.device_name);
    info!(stream = %self.name, device = %device_node.display(), "Preparing for capture");

    let debris = self.mount_point.join(RESERVED_DIR);
    match tokio::fs::remove_dir_all(&debris).await {
      Ok(()) => debug!(stream = %self.name, path = %debris.display(), "Removed debris"),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(HostError::io(format!("removing {}", debris.display()), e).into()),
    }

    let boot_dir = boot_stub(&self.mount_point).await?;
    let root_label = self.boot_label.clone().unwrap_or_default();
    let request = BootRequest {
      root: &self.mount_point,
      device_node: &device_node,
      root_label: &root_label,
      kernel_options: &self.env.config.capture.kernel_options,
      boot_dir: &boot_dir,
    };
    self.env.host.boot.make_bootable(&request).await?;

    self.env.host.mounter.unmount(&self.mount_point).await?;
    self.env.host.mounter.sync().await?;
    Ok(())
  }

  /// Unmount so the raw device can be copied. Already unmounted is fine.
  pub(super) async fn prepare_for_copy(&mut self) -> Result<(), UnpackerError> {
    self.status.check_busy(StreamOp::PrepareForCopy)?;
    self.ensure_device().await?;
    if !self.status.check_copy()? {
      return Ok(());
    }
    self.unmount().await
  }
}

/// Names of the entries in `root/boot`, without content
async fn boot_stub(root: &Path) -> Result<FileSystem, HostError> {
  let mut fs = FileSystem::new();
  let boot = root.join("boot");
  let mut entries = match tokio::fs::read_dir(&boot).await {
    Ok(entries) => entries,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(fs),
    Err(e) => return Err(HostError::io(format!("reading {}", boot.display()), e)),
  };
  fs.insert(
    "boot",
    1,
    Inode::Directory(DirectoryInode {
      mode: 0o755,
      uid: 0,
      gid: 0,
    }),
  );
  let mut inum = 1;
  while let Some(entry) = entries
    .next_entry()
    .await
    .map_err(|e| HostError::io(format!("reading {}", boot.display()), e))?
  {
    let Some(name) = entry.file_name().to_str().map(str::to_string) else {
      continue;
    };
    inum += 1;
    fs.insert(
      format!("boot/{name}"),
      inum,
      Inode::Regular(RegularInode {
        mode: 0o644,
        uid: 0,
        gid: 0,
        size: 0,
        mtime: 0,
        hash: None,
      }),
    );
  }
  Ok(fs)
}
