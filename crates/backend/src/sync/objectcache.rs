//! Content-addressed object store kept on the device under `.subd/objects`.
//!
//! Objects live at `aa/bb/<remaining hex>` where `aabb` are the first two
//! bytes of the SHA-256 hash.

use std::{
  collections::BTreeSet,
  path::{Path, PathBuf},
};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::SyncError;
use crate::domain::{
  config::{OBJECTS_DIR, RESERVED_DIR},
  filesystem::ObjectHash,
};

#[derive(Debug, Clone)]
pub struct ObjectCache {
  dir: PathBuf,
}

impl ObjectCache {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  /// The cache belonging to a mounted root
  pub fn for_root(root: &Path) -> Self {
    Self::new(root.join(RESERVED_DIR).join(OBJECTS_DIR))
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn path_for(&self, hash: &ObjectHash) -> PathBuf {
    let hex = hash.to_hex();
    self.dir.join(&hex[0..2]).join(&hex[2..4]).join(&hex[4..])
  }

  pub fn contains(&self, hash: &ObjectHash) -> bool {
    self.path_for(hash).is_file()
  }

  /// Create the cache directory and the fan-out directory for `hash`
  pub fn prepare(&self, hash: &ObjectHash) -> Result<PathBuf, SyncError> {
    let path = self.path_for(hash);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| SyncError::io("mkdir", parent, e))?;
    }
    Ok(path)
  }

  /// List every object present. Files whose names do not form a hash are
  /// ignored.
  pub fn scan(&self) -> Result<BTreeSet<ObjectHash>, SyncError> {
    let mut hashes = BTreeSet::new();
    if !self.dir.exists() {
      return Ok(hashes);
    }
    for entry in WalkDir::new(&self.dir).min_depth(3).max_depth(3) {
      let entry = entry.map_err(|source| SyncError::Walk {
        root: self.dir.clone(),
        source,
      })?;
      if !entry.file_type().is_file() {
        continue;
      }
      let hex: Option<String> = entry
        .path()
        .strip_prefix(&self.dir)
        .ok()
        .and_then(|rel| rel.components().map(|c| c.as_os_str().to_str()).collect());
      match hex.as_deref().map(str::parse::<ObjectHash>) {
        Some(Ok(hash)) => {
          hashes.insert(hash);
        }
        _ => debug!(path = %entry.path().display(), "Ignoring stray file in object cache"),
      }
    }
    Ok(hashes)
  }

  /// Copy `src` into the cache as `hash`, replacing atomically
  pub fn insert_from(&self, hash: &ObjectHash, src: &Path) -> Result<(), SyncError> {
    let dest = self.prepare(hash)?;
    let temp = dest.with_extension("partial");
    std::fs::copy(src, &temp).map_err(|e| SyncError::io("copy", src, e))?;
    std::fs::rename(&temp, &dest).map_err(|e| SyncError::io("rename", &temp, e))
  }

  pub fn remove(&self, hash: &ObjectHash) {
    let path = self.path_for(hash);
    if let Err(e) = std::fs::remove_file(&path)
      && e.kind() != std::io::ErrorKind::NotFound
    {
      warn!(path = %path.display(), error = %e, "Failed to remove cached object");
    }
  }
}
