use std::{path::Path, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info};

use super::{HostError, Partitioner, command, first_partition};

/// Partitions with `parted` and formats with `mkfs.ext4`
#[derive(Debug, Clone)]
pub struct SystemPartitioner {
  /// How long to wait for udev to publish the new partition node
  settle: Duration,
}

impl Default for SystemPartitioner {
  fn default() -> Self {
    Self {
      settle: Duration::from_secs(1),
    }
  }
}

/// Label for a freshly created root filesystem
pub(crate) fn root_label_now() -> String {
  format!("rootfs@{:x}", Utc::now().timestamp())
}

#[async_trait]
impl Partitioner for SystemPartitioner {
  async fn partition_and_format(&self, device_node: &Path) -> Result<String, HostError> {
    command::run(Command::new("parted").arg("-s").arg("-a").arg("optimal").arg(device_node).args([
      "mklabel", "msdos", "mkpart", "primary", "ext2", "0%", "100%",
    ]))
    .await?;
    debug!(device = %device_node.display(), "Partition table written");

    // udev may remove and recreate the partition node right after the table
    // is written
    tokio::time::sleep(self.settle).await;
    let partition = first_partition(device_node).await?;

    let label = root_label_now();
    command::run(Command::new("mkfs.ext4").arg("-L").arg(&label).arg(&partition)).await?;
    // still a block device, or udev replaced it under us
    first_partition(device_node).await?;

    info!(device = %device_node.display(), partition = %partition.display(), label = %label, "Created root filesystem");
    Ok(label)
  }
}
