//! Host collaborators - block devices, partitioning, mounting, boot setup and export.
//!
//! Each concern is a trait so the stream workflows can run against in-memory
//! fakes in tests. The system implementations shell out to the usual tools
//! (`parted`, `mkfs.ext4`, `mount`, `umount`, `e2label`, `chroot`).

mod bootable;
mod command;
mod devices;
mod export;
mod mount;
mod partition;

use std::{
  collections::BTreeSet,
  path::{Path, PathBuf},
  sync::Arc,
};

use async_trait::async_trait;
pub use bootable::ChrootBootMaker;
pub use command::CommandOutput;
pub use devices::{SysfsBlockDevices, first_partition};
pub use export::SystemExporter;
pub use mount::SystemMounter;
pub use partition::SystemPartitioner;

use crate::domain::{config::Config, filesystem::FileSystem};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: std::io::Error,
  },
  #[error("{program} failed ({status}): {output}")]
  Command {
    program: String,
    status: String,
    output: String,
  },
  #[error("no partitions found for: {0}")]
  NoPartition(PathBuf),
  #[error("{0} is not a block device")]
  NotBlockDevice(PathBuf),
  #[error("invalid value in {path}: {value:?}")]
  Sysfs { path: PathBuf, value: String },
  #[error("unknown user: {0}")]
  UnknownUser(String),
}

impl HostError {
  pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
    Self::Io {
      context: context.into(),
      source,
    }
  }
}

/// Block devices visible to the OS
#[async_trait]
pub trait BlockDevices: Send + Sync {
  /// Kernel names of every visible block device
  async fn list(&self) -> Result<BTreeSet<String>, HostError>;
  /// Size of the device in bytes
  async fn size(&self, name: &str) -> Result<u64, HostError>;
  /// Device node for a kernel name (`/dev/<name>`)
  fn device_node(&self, name: &str) -> PathBuf;
  /// Path of the first partition on the device
  async fn partition(&self, name: &str) -> Result<PathBuf, HostError>;
  /// Filesystem label of a partition
  async fn label(&self, partition: &Path) -> Result<String, HostError>;
}

#[async_trait]
pub trait Partitioner: Send + Sync {
  /// Write a single-partition table onto the device and create the root
  /// filesystem. Returns the filesystem label.
  async fn partition_and_format(&self, device_node: &Path) -> Result<String, HostError>;
}

#[async_trait]
pub trait Mounter: Send + Sync {
  async fn mount(&self, partition: &Path, target: &Path, fstype: &str) -> Result<(), HostError>;
  async fn unmount(&self, target: &Path) -> Result<(), HostError>;
  /// Flush filesystem buffers to disk
  async fn sync(&self) -> Result<(), HostError>;
}

/// Everything the boot maker needs to know about the captured root
#[derive(Debug)]
pub struct BootRequest<'a> {
  pub root: &'a Path,
  pub device_node: &'a Path,
  pub root_label: &'a str,
  pub kernel_options: &'a str,
  /// Entry names of the root's `boot/` directory
  pub boot_dir: &'a FileSystem,
}

#[async_trait]
pub trait BootMaker: Send + Sync {
  async fn make_bootable(&self, request: &BootRequest<'_>) -> Result<(), HostError>;
}

#[async_trait]
pub trait Exporter: Send + Sync {
  /// Stream the raw device through the export tool
  async fn export(&self, device_node: &Path, export_type: &str, destination: &str) -> Result<(), HostError>;
}

/// The set of host collaborators shared by every stream actor
#[derive(Clone)]
pub struct Host {
  pub devices: Arc<dyn BlockDevices>,
  pub partitioner: Arc<dyn Partitioner>,
  pub mounter: Arc<dyn Mounter>,
  pub boot: Arc<dyn BootMaker>,
  pub exporter: Arc<dyn Exporter>,
}

impl Host {
  /// Collaborators backed by the running system
  pub fn system(config: &Config) -> Self {
    Self {
      devices: Arc::new(SysfsBlockDevices::default()),
      partitioner: Arc::new(SystemPartitioner::default()),
      mounter: Arc::new(SystemMounter),
      boot: Arc::new(ChrootBootMaker::new(config.capture.make_bootable_tool.clone())),
      exporter: Arc::new(SystemExporter::new(
        config.export.tool.clone(),
        config.export.username.clone(),
      )),
    }
  }
}

impl std::fmt::Debug for Host {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Host").finish_non_exhaustive()
  }
}
