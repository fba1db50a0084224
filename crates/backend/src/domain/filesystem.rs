//! Filesystem model shared by the scanner, the diff builder and the updater.
//!
//! A [`FileSystem`] is an inode table plus an entry table mapping relative
//! paths to inode numbers. Several paths naming the same inode number are
//! hardlinks. Paths are `/`-separated, relative to the filesystem root and
//! never contain `.` or `..` components.

use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
  str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

// ============================================================================
// Object hashes
// ============================================================================

/// SHA-256 content hash identifying an object in the image store
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHash([u8; 32]);

impl ObjectHash {
  pub const fn from_bytes(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }

  /// Hash an in-memory buffer
  pub fn of(data: &[u8]) -> Self {
    Self(Sha256::digest(data).into())
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl From<Sha256> for ObjectHash {
  fn from(hasher: Sha256) -> Self {
    Self(hasher.finalize().into())
  }
}

impl fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl fmt::Debug for ObjectHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ObjectHash({})", &self.to_hex()[..12])
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashParseError {
  #[error("invalid hex in object hash: {0}")]
  Hex(String),
  #[error("object hash must be 32 bytes, got {0}")]
  Length(usize),
}

impl FromStr for ObjectHash {
  type Err = HashParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s).map_err(|e| HashParseError::Hex(e.to_string()))?;
    let len = bytes.len();
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| HashParseError::Length(len))?;
    Ok(Self(bytes))
  }
}

impl Serialize for ObjectHash {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for ObjectHash {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

// ============================================================================
// Inodes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularInode {
  /// Permission bits (`st_mode & 0o7777`)
  pub mode: u32,
  pub uid: u32,
  pub gid: u32,
  pub size: u64,
  /// Modification time, seconds since the epoch
  #[serde(default)]
  pub mtime: i64,
  /// Content hash; absent for empty files
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hash: Option<ObjectHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInode {
  pub mode: u32,
  pub uid: u32,
  pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkInode {
  pub uid: u32,
  pub gid: u32,
  pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Inode {
  Regular(RegularInode),
  Directory(DirectoryInode),
  Symlink(SymlinkInode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
  Regular,
  Directory,
  Symlink,
}

impl Inode {
  pub fn kind(&self) -> InodeKind {
    match self {
      Self::Regular(_) => InodeKind::Regular,
      Self::Directory(_) => InodeKind::Directory,
      Self::Symlink(_) => InodeKind::Symlink,
    }
  }

  pub fn as_regular(&self) -> Option<&RegularInode> {
    match self {
      Self::Regular(inode) => Some(inode),
      _ => None,
    }
  }
}

// ============================================================================
// FileSystem
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileSystemError {
  #[error("invalid path: {0:?}")]
  InvalidPath(String),
  #[error("entry {path} references missing inode {inode}")]
  MissingInode { path: String, inode: u64 },
  #[error("parent of {0} is not a directory in the image")]
  MissingParent(String),
  #[error("directory {0} is hardlinked")]
  LinkedDirectory(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystem {
  /// Inode number -> inode
  pub inodes: BTreeMap<u64, Inode>,
  /// Relative path -> inode number
  pub entries: BTreeMap<String, u64>,
}

impl FileSystem {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an entry. The inode is recorded the first time its number is seen,
  /// later entries with the same number become hardlinks to it.
  pub fn insert(&mut self, path: impl Into<String>, inum: u64, inode: Inode) {
    self.inodes.entry(inum).or_insert(inode);
    self.entries.insert(path.into(), inum);
  }

  /// Drop entries and any inode no longer referenced by a remaining entry
  pub fn remove_paths<'a>(&mut self, paths: impl IntoIterator<Item = &'a str>) {
    for path in paths {
      self.entries.remove(path);
    }
    let live: BTreeSet<u64> = self.entries.values().copied().collect();
    self.inodes.retain(|inum, _| live.contains(inum));
  }

  pub fn inode(&self, path: &str) -> Option<&Inode> {
    self.entries.get(path).and_then(|inum| self.inodes.get(inum))
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Iterate over (path, inode) for every regular file entry
  pub fn regular_files(&self) -> impl Iterator<Item = (&str, &RegularInode)> {
    self.entries.iter().filter_map(|(path, inum)| {
      self
        .inodes
        .get(inum)
        .and_then(Inode::as_regular)
        .map(|inode| (path.as_str(), inode))
    })
  }

  /// Content hashes of every non-empty regular file
  pub fn hashes(&self) -> BTreeSet<ObjectHash> {
    self
      .inodes
      .values()
      .filter_map(Inode::as_regular)
      .filter(|inode| inode.size > 0)
      .filter_map(|inode| inode.hash)
      .collect()
  }

  /// Map each content hash to the paths holding it
  pub fn paths_by_hash(&self) -> BTreeMap<ObjectHash, Vec<&str>> {
    let mut map: BTreeMap<ObjectHash, Vec<&str>> = BTreeMap::new();
    for (path, inode) in self.regular_files() {
      if inode.size > 0
        && let Some(hash) = inode.hash
      {
        map.entry(hash).or_default().push(path);
      }
    }
    map
  }

  /// Total bytes of file content, counting hardlinked inodes once
  pub fn total_data_bytes(&self) -> u64 {
    self
      .inodes
      .values()
      .filter_map(Inode::as_regular)
      .map(|inode| inode.size)
      .sum()
  }

  /// Check that every path is well formed, references a known inode and
  /// sits below a directory entry.
  pub fn validate(&self) -> Result<(), FileSystemError> {
    let mut directory_links: BTreeMap<u64, usize> = BTreeMap::new();
    for (path, inum) in &self.entries {
      if !is_clean_path(path) {
        return Err(FileSystemError::InvalidPath(path.clone()));
      }
      let Some(inode) = self.inodes.get(inum) else {
        return Err(FileSystemError::MissingInode {
          path: path.clone(),
          inode: *inum,
        });
      };
      if inode.kind() == InodeKind::Directory {
        let links = directory_links.entry(*inum).or_default();
        *links += 1;
        if *links > 1 {
          return Err(FileSystemError::LinkedDirectory(path.clone()));
        }
      }
      if let Some(parent) = parent_path(path)
        && !matches!(self.inode(parent), Some(Inode::Directory(_)))
      {
        return Err(FileSystemError::MissingParent(path.clone()));
      }
    }
    Ok(())
  }
}

/// Parent of a relative path, `None` for top-level entries
pub fn parent_path(path: &str) -> Option<&str> {
  path.rsplit_once('/').map(|(parent, _)| parent)
}

fn is_clean_path(path: &str) -> bool {
  !path.is_empty() && path.split('/').all(|c| !c.is_empty() && c != "." && c != "..")
}
