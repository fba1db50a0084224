//! Activity tracking for the daemon status report.

use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Remembers when the unpacker was last asked to do anything.
#[derive(Debug)]
pub struct KeepAlive {
  last_activity: RwLock<Instant>,
}

impl Default for KeepAlive {
  fn default() -> Self {
    Self::new()
  }
}

impl KeepAlive {
  pub fn new() -> Self {
    Self {
      last_activity: RwLock::new(Instant::now()),
    }
  }

  /// Record activity now
  pub async fn touch(&self) {
    *self.last_activity.write().await = Instant::now();
  }

  pub async fn idle_duration(&self) -> Duration {
    self.last_activity.read().await.elapsed()
  }
}
