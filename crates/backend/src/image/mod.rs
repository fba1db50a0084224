//! Image server collaborators.
//!
//! [`ImageSource`] answers whether a named image is available yet and
//! returns its filesystem; [`ObjectFetcher`] streams individual content
//! objects into the on-device object cache.

mod http;

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
pub use http::HttpImageClient;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{
  config::ImageConfig,
  filesystem::{FileSystem, ObjectHash},
};

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
  #[error("Request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("Image server returned {status} for {url}")]
  Status { status: u16, url: String },
  #[error("Object {expected} has hash {actual}")]
  HashMismatch { expected: ObjectHash, actual: ObjectHash },
  #[error("Object {hash} not found on image server")]
  ObjectNotFound { hash: ObjectHash },
  #[error("IO error writing {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Cancelled while waiting for image")]
  Cancelled,
}

/// An image as served by the image server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
  pub file_system: FileSystem,
}

#[async_trait]
pub trait ImageSource: Send + Sync {
  /// Fetch an image, or `None` if it is not available yet
  async fn get_image(&self, name: &str) -> Result<Option<Image>, ImageError>;
}

#[async_trait]
pub trait ObjectFetcher: Send + Sync {
  /// Write the object with `hash` to `dest`, verifying its content.
  /// Returns the number of bytes written.
  async fn fetch(&self, hash: ObjectHash, dest: &Path) -> Result<u64, ImageError>;
}

/// Backoff between availability polls: starts at `poll_initial_ms` and grows
/// by `poll_step_ms` after every "not ready" answer, up to `poll_max_ms`.
#[derive(Debug, Clone, Copy)]
pub struct PollInterval {
  current: Duration,
  step: Duration,
  max: Duration,
}

impl PollInterval {
  pub fn new(config: &ImageConfig) -> Self {
    Self {
      current: Duration::from_millis(config.poll_initial_ms),
      step: Duration::from_millis(config.poll_step_ms),
      max: Duration::from_millis(config.poll_max_ms),
    }
  }

  pub fn current(&self) -> Duration {
    self.current
  }

  fn grow(&mut self) {
    if self.current < self.max {
      self.current = (self.current + self.step).min(self.max);
    }
  }
}

/// Poll `source` until `name` becomes available.
///
/// There is no attempt limit; only cancellation stops the loop early.
pub async fn wait_for_image(
  source: &Arc<dyn ImageSource>,
  name: &str,
  config: &ImageConfig,
  cancel: &CancellationToken,
) -> Result<Image, ImageError> {
  info!(image = name, "Getting image");
  let mut interval = PollInterval::new(config);
  let mut attempts: u64 = 0;
  loop {
    attempts += 1;
    match source.get_image(name).await {
      Ok(Some(image)) => {
        info!(image = name, attempts, entries = image.file_system.len(), "Image available");
        return Ok(image);
      }
      Ok(None) => {
        info!(image = name, attempts, "Image not ready yet");
        interval.grow();
      }
      // connection failures keep the current interval
      Err(e) => warn!(image = name, attempts, error = %e, "Error getting image"),
    }

    tokio::select! {
      biased;

      _ = cancel.cancelled() => return Err(ImageError::Cancelled),
      _ = tokio::time::sleep(interval.current()) => {}
    }
  }
}
