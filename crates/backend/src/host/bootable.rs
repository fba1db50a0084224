use std::{os::unix::fs::PermissionsExt, path::PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{BootMaker, BootRequest, HostError, command};

/// File name of the tool once copied into the captured root
const TOOL_NAME: &str = "make-bootable";

/// Runs the make-bootable tool inside the captured root with `chroot`
#[derive(Debug, Clone)]
pub struct ChrootBootMaker {
  tool: PathBuf,
}

impl ChrootBootMaker {
  pub fn new(tool: PathBuf) -> Self {
    Self { tool }
  }
}

#[async_trait]
impl BootMaker for ChrootBootMaker {
  async fn make_bootable(&self, request: &BootRequest<'_>) -> Result<(), HostError> {
    let installed = request.root.join(TOOL_NAME);
    let copied = match tokio::fs::symlink_metadata(&installed).await {
      Ok(_) => false,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        tokio::fs::copy(&self.tool, &installed)
          .await
          .map_err(|e| HostError::io(format!("failed to copy {}", self.tool.display()), e))?;
        tokio::fs::set_permissions(&installed, std::fs::Permissions::from_mode(0o755))
          .await
          .map_err(|e| HostError::io(format!("failed to chmod {}", installed.display()), e))?;
        true
      }
      Err(e) => return Err(HostError::io(format!("failed to stat {}", installed.display()), e)),
    };

    let kernels: Vec<&str> = request
      .boot_dir
      .entries
      .keys()
      .filter_map(|path| path.strip_prefix("boot/"))
      .filter(|name| name.starts_with("vmlinuz"))
      .collect();
    info!(root = %request.root.display(), label = request.root_label, kernels = ?kernels, "Making root bootable");

    let mut cmd = Command::new("chroot");
    cmd
      .arg(request.root)
      .arg(format!("/{TOOL_NAME}"))
      .arg(request.device_node)
      .env("ROOT_LABEL", request.root_label)
      .env("KERNEL_OPTIONS", request.kernel_options);
    let result = command::run(&mut cmd).await;

    if copied && let Err(e) = tokio::fs::remove_file(&installed).await {
      warn!(path = %installed.display(), error = %e, "Failed to remove make-bootable tool");
    }
    result.map(|_| ())
  }
}
