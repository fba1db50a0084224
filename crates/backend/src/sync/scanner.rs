//! Walk a mounted root into a [`FileSystem`].

use std::{
  fs::File,
  io::{BufReader, Read},
  os::unix::fs::MetadataExt,
  path::Path,
  time::Instant,
};

use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use walkdir::WalkDir;

use super::SyncError;
use crate::domain::{
  config::RESERVED_DIR,
  filesystem::{DirectoryInode, FileSystem, Inode, ObjectHash, RegularInode, SymlinkInode},
};

/// Scan everything below `root` except the reserved directory.
///
/// Hardlinked files share one inode entry. Device nodes, sockets and fifos
/// are skipped.
pub fn scan(root: &Path) -> Result<FileSystem, SyncError> {
  let start = Instant::now();
  std::fs::metadata(root).map_err(|e| SyncError::io("stat", root, e))?;
  let mut fs = FileSystem::new();
  let mut hashed_bytes = 0u64;

  let walker = WalkDir::new(root)
    .min_depth(1)
    .follow_links(false)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| !(e.depth() == 1 && e.file_name() == RESERVED_DIR));

  for entry in walker {
    let entry = entry.map_err(|source| SyncError::Walk {
      root: root.to_path_buf(),
      source,
    })?;
    let path = entry.path();
    let relative = relative_path(root, path)?;
    let meta = entry
      .metadata()
      .map_err(|source| SyncError::Walk {
        root: root.to_path_buf(),
        source,
      })?;
    let file_type = meta.file_type();

    let inode = if file_type.is_dir() {
      Inode::Directory(DirectoryInode {
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
      })
    } else if file_type.is_symlink() {
      let target = std::fs::read_link(path).map_err(|e| SyncError::io("readlink", path, e))?;
      let target = target
        .to_str()
        .ok_or_else(|| SyncError::NonUtf8Path(target.clone()))?
        .to_string();
      Inode::Symlink(SymlinkInode {
        uid: meta.uid(),
        gid: meta.gid(),
        target,
      })
    } else if file_type.is_file() {
      // hardlinks reuse the inode recorded for the first path
      let hash = if meta.size() == 0 || fs.inodes.contains_key(&meta.ino()) {
        None
      } else {
        hashed_bytes += meta.size();
        Some(hash_file(path)?)
      };
      Inode::Regular(RegularInode {
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        mtime: meta.mtime(),
        hash,
      })
    } else {
      trace!(path = %path.display(), "Skipping special file");
      continue;
    };
    fs.insert(relative, meta.ino(), inode);
  }

  debug!(
    root = %root.display(),
    entries = fs.len(),
    inodes = fs.inodes.len(),
    hashed_bytes,
    elapsed_ms = start.elapsed().as_millis() as u64,
    "Filesystem scanned"
  );
  Ok(fs)
}

/// SHA-256 of a file's content
pub fn hash_file(path: &Path) -> Result<ObjectHash, SyncError> {
  let file = File::open(path).map_err(|e| SyncError::io("open", path, e))?;
  let mut reader = BufReader::with_capacity(1 << 16, file);
  let mut hasher = Sha256::new();
  let mut buf = vec![0u8; 1 << 16];
  loop {
    let n = reader.read(&mut buf).map_err(|e| SyncError::io("read", path, e))?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  Ok(ObjectHash::from(hasher))
}

fn relative_path(root: &Path, path: &Path) -> Result<String, SyncError> {
  let relative = path.strip_prefix(root).unwrap_or(path);
  let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
  parts
    .map(|parts| parts.join("/"))
    .ok_or_else(|| SyncError::NonUtf8Path(path.to_path_buf()))
}
