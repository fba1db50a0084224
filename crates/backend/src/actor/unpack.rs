//! Unpack workflow: delete what the image cannot use, fetch what is missing,
//! then update the mounted root to match.

use std::{path::Path, sync::Arc, time::Instant};

use tracing::{debug, info, warn};

use super::{message::UnpackReport, stream::StreamActor};
use crate::{
  domain::{
    config::RESERVED_DIR,
    filesystem::{FileSystem, ObjectHash},
    stream::{StatusError, StreamOp, StreamStatus},
  },
  error::UnpackerError,
  sync::{self, ObjectCache, SyncError, diff, update},
};

/// Records the last image unpacked onto a device, inside the reserved
/// directory so scans and diffs never see it
pub const IMAGE_NAME_FILE: &str = "image-name";

impl StreamActor {
  pub(super) async fn unpack(
    &mut self,
    image_name: &str,
    desired: Arc<FileSystem>,
  ) -> Result<UnpackReport, UnpackerError> {
    self.status.check_unpack()?;
    let Some(current) = self.file_system.take() else {
      return Err(
        StatusError {
          op: StreamOp::Unpack,
          status: self.status,
          reason: "not yet scanned",
        }
        .into(),
      );
    };
    let cached = self.object_cache.take().unwrap_or_default();
    let mut current = Arc::unwrap_or_clone(current);
    // the scan is consumed from here on
    self.publish().await;

    let mut report = UnpackReport {
      image_name: image_name.to_string(),
      ..Default::default()
    };

    let unneeded = diff::unneeded_paths(&current, &desired);
    if !unneeded.is_empty() {
      info!(stream = %self.name, image = image_name, count = unneeded.len(), "Deleting unneeded files");
      report.deleted = unneeded.len();
      let root = self.mount_point.clone();
      let image = image_name.to_string();
      let paths = unneeded.clone();
      if let Err(e) = sync::blocking(move || delete_paths(&root, &image, &paths)).await {
        self.set_status(StreamStatus::Mounted).await;
        return Err(e.into());
      }
      current.remove_paths(unneeded.iter().map(String::as_str));
    }

    let missing = diff::missing_objects(&current, &cached, &desired);
    self.set_status(StreamStatus::Fetching).await;
    match self.fetch(image_name, &missing).await {
      Ok(bytes) => {
        report.fetched_objects = missing.len();
        report.fetched_bytes = bytes;
      }
      Err(e) => {
        self.set_status(StreamStatus::Mounted).await;
        return Err(e);
      }
    }

    self.set_status(StreamStatus::Updating).await;
    info!(stream = %self.name, image = image_name, "Update starting");
    let start = Instant::now();
    let root = self.mount_point.clone();
    let image = image_name.to_string();
    let result = sync::blocking(move || {
      let stats = update::apply(&root, &ObjectCache::for_root(&root), &current, &desired)?;
      write_image_name(&root, &image)?;
      Ok(stats)
    })
    .await;
    self.set_status(StreamStatus::Mounted).await;
    report.update = result?;

    info!(
      stream = %self.name,
      image = image_name,
      deleted = report.deleted,
      fetched_objects = report.fetched_objects,
      fetched_bytes = report.fetched_bytes,
      elapsed_ms = start.elapsed().as_millis() as u64,
      "Update completed"
    );
    Ok(report)
  }

  /// Fetch every missing object into the on-device cache, one at a time.
  /// Returns the total bytes written.
  async fn fetch(&self, image_name: &str, missing: &[ObjectHash]) -> Result<u64, UnpackerError> {
    if missing.is_empty() {
      debug!(stream = %self.name, image = image_name, "No objects to fetch");
      return Ok(0);
    }
    let start = Instant::now();
    info!(stream = %self.name, image = image_name, objects = missing.len(), "Fetching objects");

    let cache = ObjectCache::for_root(&self.mount_point);
    let mut bytes = 0u64;
    for hash in missing {
      let dest = cache.prepare(hash)?;
      bytes += self.env.objects.fetch(*hash, &dest).await?;
    }

    info!(
      stream = %self.name,
      image = image_name,
      objects = missing.len(),
      bytes,
      elapsed_ms = start.elapsed().as_millis() as u64,
      "Fetched objects"
    );
    Ok(bytes)
  }
}

/// Individual delete failures are only logged; a missing root is an error
fn delete_paths(root: &Path, image: &str, paths: &[String]) -> Result<(), SyncError> {
  if let Err(e) = std::fs::metadata(root) {
    return Err(SyncError::io("stat", root, e));
  }
  for path in paths {
    info!(image, path = %path, "Delete");
    if let Err(e) = std::fs::remove_file(root.join(path))
      && e.kind() != std::io::ErrorKind::NotFound
    {
      warn!(image, path = %path, error = %e, "Failed to delete unneeded file");
    }
  }
  Ok(())
}

fn write_image_name(root: &Path, image: &str) -> Result<(), SyncError> {
  let dir = root.join(RESERVED_DIR);
  std::fs::create_dir_all(&dir).map_err(|e| SyncError::io("mkdir", &dir, e))?;
  let path = dir.join(IMAGE_NAME_FILE);
  std::fs::write(&path, format!("{image}\n")).map_err(|e| SyncError::io("write", &path, e))
}
