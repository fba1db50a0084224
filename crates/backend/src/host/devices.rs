use std::{
  collections::BTreeSet,
  os::unix::fs::FileTypeExt,
  path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::process::Command;

use super::{BlockDevices, HostError, command};

/// Block devices as reported by sysfs
#[derive(Debug, Clone)]
pub struct SysfsBlockDevices {
  sysfs_dir: PathBuf,
  dev_dir: PathBuf,
}

impl Default for SysfsBlockDevices {
  fn default() -> Self {
    Self::new("/sys/block", "/dev")
  }
}

impl SysfsBlockDevices {
  pub fn new(sysfs_dir: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
    Self {
      sysfs_dir: sysfs_dir.into(),
      dev_dir: dev_dir.into(),
    }
  }
}

#[async_trait]
impl BlockDevices for SysfsBlockDevices {
  async fn list(&self) -> Result<BTreeSet<String>, HostError> {
    let context = || format!("failed to list {}", self.sysfs_dir.display());
    let mut dir = tokio::fs::read_dir(&self.sysfs_dir)
      .await
      .map_err(|e| HostError::io(context(), e))?;
    let mut names = BTreeSet::new();
    while let Some(entry) = dir.next_entry().await.map_err(|e| HostError::io(context(), e))? {
      names.insert(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
  }

  async fn size(&self, name: &str) -> Result<u64, HostError> {
    let path = self.sysfs_dir.join(name).join("size");
    let value = tokio::fs::read_to_string(&path)
      .await
      .map_err(|e| HostError::io(format!("failed to read {}", path.display()), e))?;
    // sysfs reports 512-byte sectors regardless of the logical block size
    let sectors: u64 = value.trim().parse().map_err(|_| HostError::Sysfs {
      path: path.clone(),
      value: value.trim().to_string(),
    })?;
    Ok(sectors * 512)
  }

  fn device_node(&self, name: &str) -> PathBuf {
    self.dev_dir.join(name)
  }

  async fn partition(&self, name: &str) -> Result<PathBuf, HostError> {
    first_partition(&self.device_node(name)).await
  }

  async fn label(&self, partition: &Path) -> Result<String, HostError> {
    let output = command::run(Command::new("e2label").arg(partition)).await?;
    Ok(output.trimmed().to_string())
  }
}

/// Find the first partition of a disk: `<node>1`, or `<node>p1` for
/// nvme/mmc style names.
pub async fn first_partition(device_node: &Path) -> Result<PathBuf, HostError> {
  let node = device_node.as_os_str().to_string_lossy();
  for candidate in [format!("{node}1"), format!("{node}p1")] {
    let candidate = PathBuf::from(candidate);
    match tokio::fs::symlink_metadata(&candidate).await {
      Ok(meta) if meta.file_type().is_block_device() => return Ok(candidate),
      Ok(_) => return Err(HostError::NotBlockDevice(candidate)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
      Err(e) => return Err(HostError::io(format!("failed to stat {}", candidate.display()), e)),
    }
  }
  Err(HostError::NoPartition(device_node.to_path_buf()))
}
