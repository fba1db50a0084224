use std::{
  ffi::CString,
  path::{Path, PathBuf},
  process::Stdio,
  time::Instant,
};

use async_trait::async_trait;
use nix::unistd::{Gid, Uid, User, getgrouplist, setgid, setgroups, setuid};
use tokio::process::Command;
use tracing::info;

use super::{Exporter, HostError, command};

/// Credentials the export tool runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredentials {
  pub uid: Uid,
  pub gid: Gid,
  /// Supplementary groups, including the primary group
  pub groups: Vec<Gid>,
}

/// Look up a user and its supplementary groups in the system databases
pub fn lookup_user(username: &str) -> Result<UserCredentials, HostError> {
  let user = User::from_name(username)
    .map_err(|e| HostError::io(format!("failed to look up user {username}"), e.into()))?
    .ok_or_else(|| HostError::UnknownUser(username.to_string()))?;
  let name = CString::new(user.name.as_str()).map_err(|_| HostError::UnknownUser(username.to_string()))?;
  let groups = getgrouplist(&name, user.gid)
    .map_err(|e| HostError::io(format!("failed to list groups of {username}"), e.into()))?;

  Ok(UserCredentials {
    uid: user.uid,
    gid: user.gid,
    groups,
  })
}

/// Runs the external export tool as an unprivileged user
#[derive(Debug, Clone)]
pub struct SystemExporter {
  tool: PathBuf,
  username: String,
}

impl SystemExporter {
  pub fn new(tool: PathBuf, username: String) -> Self {
    Self { tool, username }
  }
}

#[async_trait]
impl Exporter for SystemExporter {
  async fn export(&self, device_node: &Path, export_type: &str, destination: &str) -> Result<(), HostError> {
    let creds = lookup_user(&self.username)?;
    let device = tokio::fs::File::open(device_node)
      .await
      .map_err(|e| HostError::io(format!("failed to open {}", device_node.display()), e))?
      .into_std()
      .await;

    let mut cmd = Command::new(&self.tool);
    cmd.arg(export_type).arg(destination).stdin(Stdio::from(device));
    let UserCredentials { uid, gid, groups } = creds.clone();
    // SAFETY: the closure only makes async-signal-safe credential syscalls
    unsafe {
      cmd.pre_exec(move || {
        setgroups(&groups)
          .and_then(|_| setgid(gid))
          .and_then(|_| setuid(uid))
          .map_err(std::io::Error::from)
      });
    }

    let start = Instant::now();
    command::run(&mut cmd).await?;
    info!(
      tool = %self.tool.display(),
      export_type,
      destination,
      uid = creds.uid.as_raw(),
      elapsed_ms = start.elapsed().as_millis() as u64,
      "Export tool finished"
    );
    Ok(())
  }
}
