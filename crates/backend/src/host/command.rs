//! Subprocess helper shared by the system collaborators

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, trace};

use super::HostError;

/// Captured output of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
  /// stdout followed by stderr
  pub combined: String,
}

impl CommandOutput {
  pub fn trimmed(&self) -> &str {
    self.combined.trim()
  }
}

/// Run `cmd` to completion, failing with the combined output on a non-zero exit.
pub(crate) async fn run(cmd: &mut Command) -> Result<CommandOutput, HostError> {
  let program = cmd.as_std().get_program().to_string_lossy().into_owned();
  trace!(program = %program, args = ?cmd.as_std().get_args().collect::<Vec<_>>(), "Running command");

  if cmd.as_std().get_current_dir().is_none() {
    cmd.current_dir("/");
  }
  let output = cmd
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .output()
    .await
    .map_err(|e| HostError::io(format!("failed to run {program}"), e))?;

  let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
  combined.push_str(&String::from_utf8_lossy(&output.stderr));

  if !output.status.success() {
    debug!(program = %program, status = %output.status, "Command failed");
    return Err(HostError::Command {
      program,
      status: output.status.to_string(),
      output: combined.trim().to_string(),
    });
  }
  Ok(CommandOutput { combined })
}
