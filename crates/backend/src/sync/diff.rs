//! What an image needs from the device.

use std::collections::BTreeSet;

use crate::domain::filesystem::{FileSystem, ObjectHash};

/// Regular files on the device that the image has no use for.
///
/// A non-empty file is unneeded when no file in the image has its content;
/// an empty file is unneeded when the image has nothing at its path.
pub fn unneeded_paths(current: &FileSystem, desired: &FileSystem) -> Vec<String> {
  let wanted = desired.hashes();
  current
    .regular_files()
    .filter(|(path, inode)| match (inode.size, inode.hash) {
      (0, _) | (_, None) => !desired.entries.contains_key(*path),
      (_, Some(hash)) => !wanted.contains(&hash),
    })
    .map(|(path, _)| path.to_string())
    .collect()
}

/// Objects the image needs that are neither on the device nor cached
pub fn missing_objects(
  current: &FileSystem,
  cached: &BTreeSet<ObjectHash>,
  desired: &FileSystem,
) -> Vec<ObjectHash> {
  let present = current.hashes();
  desired
    .hashes()
    .into_iter()
    .filter(|hash| !present.contains(hash) && !cached.contains(hash))
    .collect()
}
