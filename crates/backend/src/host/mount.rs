use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{HostError, Mounter, command};

/// Mounts through the `mount`/`umount` binaries
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter;

#[async_trait]
impl Mounter for SystemMounter {
  async fn mount(&self, partition: &Path, target: &Path, fstype: &str) -> Result<(), HostError> {
    command::run(Command::new("mount").arg("-t").arg(fstype).arg(partition).arg(target)).await?;
    debug!(partition = %partition.display(), target = %target.display(), "Mounted");
    Ok(())
  }

  async fn unmount(&self, target: &Path) -> Result<(), HostError> {
    command::run(Command::new("umount").arg(target)).await?;
    debug!(target = %target.display(), "Unmounted");
    Ok(())
  }

  async fn sync(&self) -> Result<(), HostError> {
    tokio::task::spawn_blocking(|| {
      // SAFETY: sync(2) takes no arguments and cannot fail
      unsafe { libc::sync() }
    })
    .await
    .map_err(|e| HostError::io("sync task failed", std::io::Error::other(e)))
  }
}
