//! Turn a mounted root into the image's filesystem.
//!
//! Paths that already match the image are left alone. Everything else is
//! removed and recreated, with file content taken from the object cache or
//! from a kept path holding the same content. Metadata is applied last.

use std::{
  collections::{BTreeMap, BTreeSet},
  fs::{File, Permissions},
  os::unix::fs::{MetadataExt, PermissionsExt},
  path::Path,
  time::{Duration, Instant, SystemTime},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::{ObjectCache, SyncError};
use crate::domain::filesystem::{FileSystem, Inode, InodeKind, ObjectHash};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStats {
  pub removed: usize,
  pub created: usize,
  pub linked: usize,
  pub metadata_updated: usize,
}

impl UpdateStats {
  pub fn is_noop(&self) -> bool {
    *self == Self::default()
  }
}

/// Bring `root` (currently described by `current`) to `desired`.
///
/// Every object needed by a new file must be in `cache` or present somewhere
/// in `current`; this is checked before anything is removed.
pub fn apply(
  root: &Path,
  cache: &ObjectCache,
  current: &FileSystem,
  desired: &FileSystem,
) -> Result<UpdateStats, SyncError> {
  desired.validate()?;
  let start = Instant::now();
  let plan = Plan::new(current, desired);
  let mut stats = UpdateStats::default();

  stage(root, cache, current, desired, &plan)?;

  for path in &plan.remove {
    if remove_path(&root.join(path))? {
      trace!(path, "Removed");
      stats.removed += 1;
    }
  }

  let mut leaders: BTreeMap<u64, &str> = BTreeMap::new();
  for path in &plan.keep {
    if let Some(inum) = desired.entries.get(*path)
      && matches!(desired.inodes.get(inum), Some(Inode::Regular(_)))
    {
      leaders.entry(*inum).or_insert(*path);
    }
  }

  for path in &plan.create {
    let Some(&inum) = desired.entries.get(*path) else {
      continue;
    };
    let Some(inode) = desired.inodes.get(&inum) else {
      continue;
    };
    let target = root.join(path);
    match inode {
      Inode::Directory(_) => {
        std::fs::create_dir(&target).map_err(|e| SyncError::io("mkdir", &target, e))?;
        stats.created += 1;
      }
      Inode::Symlink(link) => {
        std::os::unix::fs::symlink(&link.target, &target).map_err(|e| SyncError::io("symlink", &target, e))?;
        stats.created += 1;
      }
      Inode::Regular(file) => {
        if let Some(leader) = leaders.get(&inum) {
          let leader = root.join(leader);
          std::fs::hard_link(&leader, &target).map_err(|e| SyncError::io("link", &target, e))?;
          stats.linked += 1;
          continue;
        }
        match file.hash.filter(|_| file.size > 0) {
          None => {
            File::create(&target).map_err(|e| SyncError::io("create", &target, e))?;
          }
          Some(hash) => {
            let source = content_source(root, cache, &plan, hash)?;
            std::fs::copy(&source, &target).map_err(|e| SyncError::io("copy", &source, e))?;
          }
        }
        leaders.insert(inum, *path);
        stats.created += 1;
      }
    }
  }

  let mut seen = BTreeSet::new();
  for (path, inum) in &desired.entries {
    if !seen.insert(*inum) {
      continue;
    }
    if let Some(inode) = desired.inodes.get(inum)
      && apply_metadata(&root.join(path), inode)?
    {
      stats.metadata_updated += 1;
    }
  }

  for hash in desired.hashes() {
    cache.remove(&hash);
  }

  info!(
    root = %root.display(),
    removed = stats.removed,
    created = stats.created,
    linked = stats.linked,
    metadata_updated = stats.metadata_updated,
    elapsed_ms = start.elapsed().as_millis() as u64,
    "Filesystem updated"
  );
  Ok(stats)
}

// ============================================================================
// Planning
// ============================================================================

struct Plan<'a> {
  /// Desired paths already correct on disk (content and link structure)
  keep: BTreeSet<&'a str>,
  /// Current paths to delete, children before parents
  remove: Vec<&'a str>,
  /// Desired paths to create, parents before children
  create: Vec<&'a str>,
  /// A kept path for each content hash present on disk
  kept_content: BTreeMap<ObjectHash, &'a str>,
}

impl<'a> Plan<'a> {
  fn new(current: &'a FileSystem, desired: &'a FileSystem) -> Self {
    let mut candidates = Vec::new();
    let mut forward: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
    let mut reverse: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();

    for (path, d_inum) in &desired.entries {
      let Some(c_inum) = current.entries.get(path) else {
        continue;
      };
      let (Some(have), Some(want)) = (current.inodes.get(c_inum), desired.inodes.get(d_inum)) else {
        continue;
      };
      if !same_content(have, want) {
        continue;
      }
      if want.kind() == InodeKind::Regular {
        forward.entry(*c_inum).or_default().insert(*d_inum);
        reverse.entry(*d_inum).or_default().insert(*c_inum);
      }
      candidates.push((path.as_str(), *c_inum, *d_inum, want.kind()));
    }

    // a regular file is kept only when its on-disk link group maps one to
    // one onto the image's
    let keep: BTreeSet<&str> = candidates
      .into_iter()
      .filter(|(_, c_inum, d_inum, kind)| {
        *kind != InodeKind::Regular
          || (forward.get(c_inum).is_some_and(|s| s.len() == 1) && reverse.get(d_inum).is_some_and(|s| s.len() == 1))
      })
      .map(|(path, ..)| path)
      .collect();

    let mut remove: Vec<&str> = current
      .entries
      .keys()
      .map(String::as_str)
      .filter(|path| !keep.contains(path))
      .collect();
    remove.reverse();

    let create = desired
      .entries
      .keys()
      .map(String::as_str)
      .filter(|path| !keep.contains(path))
      .collect();

    let mut kept_content = BTreeMap::new();
    for path in &keep {
      if let Some(Inode::Regular(file)) = current.inode(path)
        && file.size > 0
        && let Some(hash) = file.hash
      {
        kept_content.entry(hash).or_insert(*path);
      }
    }

    Self {
      keep,
      remove,
      create,
      kept_content,
    }
  }
}

fn same_content(have: &Inode, want: &Inode) -> bool {
  match (have, want) {
    (Inode::Directory(_), Inode::Directory(_)) => true,
    (Inode::Symlink(a), Inode::Symlink(b)) => a.target == b.target,
    (Inode::Regular(a), Inode::Regular(b)) => a.size == b.size && (a.size == 0 || a.hash == b.hash),
    _ => false,
  }
}

/// Copy content that only lives in paths about to be removed into the cache
fn stage(
  root: &Path,
  cache: &ObjectCache,
  current: &FileSystem,
  desired: &FileSystem,
  plan: &Plan<'_>,
) -> Result<(), SyncError> {
  let on_disk = current.paths_by_hash();
  let mut staged = BTreeSet::new();
  for path in &plan.create {
    let Some(Inode::Regular(file)) = desired.inode(path) else {
      continue;
    };
    let Some(hash) = file.hash.filter(|_| file.size > 0) else {
      continue;
    };
    if staged.contains(&hash) || plan.kept_content.contains_key(&hash) || cache.contains(&hash) {
      continue;
    }
    let Some(source) = on_disk.get(&hash).and_then(|paths| paths.first()) else {
      return Err(SyncError::MissingObject(hash));
    };
    cache.insert_from(&hash, &root.join(source))?;
    debug!(hash = %hash, source, "Staged on-device content");
    staged.insert(hash);
  }
  Ok(())
}

fn content_source(
  root: &Path,
  cache: &ObjectCache,
  plan: &Plan<'_>,
  hash: ObjectHash,
) -> Result<std::path::PathBuf, SyncError> {
  if cache.contains(&hash) {
    return Ok(cache.path_for(&hash));
  }
  plan
    .kept_content
    .get(&hash)
    .map(|path| root.join(path))
    .ok_or(SyncError::MissingObject(hash))
}

// ============================================================================
// Filesystem operations
// ============================================================================

fn remove_path(path: &Path) -> Result<bool, SyncError> {
  let meta = match std::fs::symlink_metadata(path) {
    Ok(meta) => meta,
    // already gone with a removed parent
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
    Err(e) => return Err(SyncError::io("stat", path, e)),
  };
  if meta.is_dir() {
    std::fs::remove_dir_all(path).map_err(|e| SyncError::io("rmdir", path, e))?;
  } else {
    std::fs::remove_file(path).map_err(|e| SyncError::io("unlink", path, e))?;
  }
  Ok(true)
}

/// Apply ownership, mtime and mode. Returns whether anything changed.
fn apply_metadata(path: &Path, inode: &Inode) -> Result<bool, SyncError> {
  let meta = std::fs::symlink_metadata(path).map_err(|e| SyncError::io("stat", path, e))?;
  let (mode, uid, gid, mtime) = match inode {
    Inode::Regular(file) => (Some(file.mode), file.uid, file.gid, Some(file.mtime)),
    Inode::Directory(dir) => (Some(dir.mode), dir.uid, dir.gid, None),
    Inode::Symlink(link) => (None, link.uid, link.gid, None),
  };
  let mut changed = false;

  // chown clears setuid bits, so it goes before the mode
  if meta.uid() != uid || meta.gid() != gid {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid)).map_err(|e| SyncError::io("chown", path, e))?;
    changed = true;
  }

  if let Some(mtime) = mtime
    && meta.mtime() != mtime
    && let Ok(secs) = u64::try_from(mtime)
  {
    let file = File::open(path).map_err(|e| SyncError::io("open", path, e))?;
    file
      .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
      .map_err(|e| SyncError::io("utime", path, e))?;
    changed = true;
  }

  if let Some(mode) = mode
    && meta.mode() & 0o7777 != mode
  {
    std::fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| SyncError::io("chmod", path, e))?;
    changed = true;
  }

  Ok(changed)
}
