//! Filesystem synchronisation: scanning a mounted root, the on-device object
//! cache, computing what an image needs, and applying it.

pub mod diff;
pub mod objectcache;
pub mod scanner;
pub mod update;

use std::path::{Path, PathBuf};

pub use objectcache::ObjectCache;
pub use update::UpdateStats;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error("{op} {path}: {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("scan of {root} failed: {source}")]
  Walk {
    root: PathBuf,
    #[source]
    source: walkdir::Error,
  },
  #[error("path is not valid UTF-8: {0}")]
  NonUtf8Path(PathBuf),
  #[error("no content available for object {0}")]
  MissingObject(crate::domain::filesystem::ObjectHash),
  #[error("invalid image: {0}")]
  InvalidImage(#[from] crate::domain::filesystem::FileSystemError),
  #[error("background task failed: {0}")]
  Join(String),
}

impl SyncError {
  pub(crate) fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
    Self::Io {
      op,
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Run blocking filesystem work off the async runtime
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, SyncError>
where
  F: FnOnce() -> Result<T, SyncError> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| SyncError::Join(e.to_string()))?
}
