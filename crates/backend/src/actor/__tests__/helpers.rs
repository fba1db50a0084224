//! Test helpers for actor integration tests.
//!
//! Provides `UnpackerTestContext`, which owns a temporary state directory and
//! in-memory host and image server fakes. Mounting is simulated by the mount
//! point directory itself, so whatever a workflow writes "to the device"
//! stays there across unmounts.

use std::{
  collections::{BTreeMap, BTreeSet},
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{
  actor::{StreamEnv, stream::ROOT_LABEL_PREFIX},
  domain::{
    config::Config,
    filesystem::{FileSystem, ObjectHash},
  },
  host::{BlockDevices, BootMaker, BootRequest, Exporter, Host, HostError, Mounter, Partitioner},
  image::{Image, ImageError, ImageSource, ObjectFetcher},
  state::SharedStateRef,
  sync::scanner,
  unpacker::Unpacker,
};

const DEVICE_SIZE: u64 = 8 << 30;

fn injected(what: &str) -> HostError {
  HostError::io(what, std::io::Error::other("injected failure"))
}

// ============================================================================
// Host fakes
// ============================================================================

#[derive(Default)]
pub struct FakeDevices {
  visible: Mutex<BTreeSet<String>>,
  /// Labels by device name; devices without one report `rootfs@<name>`
  labels: Mutex<BTreeMap<String, String>>,
}

impl FakeDevices {
  /// Make a new block device visible
  pub fn plug(&self, name: &str) {
    self.visible.lock().unwrap().insert(name.to_string());
  }

  pub fn unplug(&self, name: &str) {
    self.visible.lock().unwrap().remove(name);
  }

  pub fn set_label(&self, name: &str, label: &str) {
    self.labels.lock().unwrap().insert(name.to_string(), label.to_string());
  }
}

#[async_trait]
impl BlockDevices for FakeDevices {
  async fn list(&self) -> Result<BTreeSet<String>, HostError> {
    Ok(self.visible.lock().unwrap().clone())
  }

  async fn size(&self, name: &str) -> Result<u64, HostError> {
    if self.visible.lock().unwrap().contains(name) {
      Ok(DEVICE_SIZE)
    } else {
      Err(HostError::NotBlockDevice(self.device_node(name)))
    }
  }

  fn device_node(&self, name: &str) -> PathBuf {
    PathBuf::from("/dev").join(name)
  }

  async fn partition(&self, name: &str) -> Result<PathBuf, HostError> {
    Ok(PathBuf::from(format!("/dev/{name}1")))
  }

  async fn label(&self, partition: &Path) -> Result<String, HostError> {
    let name = partition
      .file_name()
      .and_then(|n| n.to_str())
      .map(|n| n.trim_end_matches('1').to_string())
      .unwrap_or_default();
    Ok(
      self
        .labels
        .lock()
        .unwrap()
        .get(&name)
        .cloned()
        .unwrap_or_else(|| format!("{ROOT_LABEL_PREFIX}{name}")),
    )
  }
}

#[derive(Default)]
pub struct FakePartitioner {
  pub formatted: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl Partitioner for FakePartitioner {
  async fn partition_and_format(&self, device_node: &Path) -> Result<String, HostError> {
    self.formatted.lock().unwrap().push(device_node.to_path_buf());
    let name = device_node.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    Ok(format!("{ROOT_LABEL_PREFIX}{name}"))
  }
}

#[derive(Default)]
pub struct FakeMounter {
  /// Currently mounted targets and the partition on each
  pub mounted: Mutex<BTreeMap<PathBuf, PathBuf>>,
  pub mounts: AtomicUsize,
  pub unmounts: AtomicUsize,
  pub syncs: AtomicUsize,
  pub fail_mount: AtomicBool,
}

impl FakeMounter {
  pub fn is_mounted(&self, target: &Path) -> bool {
    self.mounted.lock().unwrap().contains_key(target)
  }
}

#[async_trait]
impl Mounter for FakeMounter {
  async fn mount(&self, partition: &Path, target: &Path, _fstype: &str) -> Result<(), HostError> {
    if self.fail_mount.load(Ordering::SeqCst) {
      return Err(injected("mount"));
    }
    tokio::fs::create_dir_all(target)
      .await
      .map_err(|e| HostError::io("creating mount point", e))?;
    self
      .mounted
      .lock()
      .unwrap()
      .insert(target.to_path_buf(), partition.to_path_buf());
    self.mounts.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn unmount(&self, target: &Path) -> Result<(), HostError> {
    self.mounted.lock().unwrap().remove(target);
    self.unmounts.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn sync(&self) -> Result<(), HostError> {
    self.syncs.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootCall {
  pub device_node: PathBuf,
  pub root_label: String,
  pub kernel_options: String,
  pub boot_entries: Vec<String>,
}

#[derive(Default)]
pub struct FakeBootMaker {
  pub calls: Mutex<Vec<BootCall>>,
  pub fail: AtomicBool,
}

#[async_trait]
impl BootMaker for FakeBootMaker {
  async fn make_bootable(&self, request: &BootRequest<'_>) -> Result<(), HostError> {
    if self.fail.load(Ordering::SeqCst) {
      return Err(injected("make bootable"));
    }
    self.calls.lock().unwrap().push(BootCall {
      device_node: request.device_node.to_path_buf(),
      root_label: request.root_label.to_string(),
      kernel_options: request.kernel_options.to_string(),
      boot_entries: request.boot_dir.entries.keys().cloned().collect(),
    });
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportCall {
  pub device_node: PathBuf,
  pub export_type: String,
  pub destination: String,
}

#[derive(Default)]
pub struct FakeExporter {
  pub calls: Mutex<Vec<ExportCall>>,
  pub fail: AtomicBool,
}

#[async_trait]
impl Exporter for FakeExporter {
  async fn export(&self, device_node: &Path, export_type: &str, destination: &str) -> Result<(), HostError> {
    self.calls.lock().unwrap().push(ExportCall {
      device_node: device_node.to_path_buf(),
      export_type: export_type.to_string(),
      destination: destination.to_string(),
    });
    if self.fail.load(Ordering::SeqCst) {
      return Err(HostError::Command {
        program: "export-image".to_string(),
        status: "exit status: 1".to_string(),
        output: "upload refused".to_string(),
      });
    }
    Ok(())
  }
}

// ============================================================================
// Image server fake
// ============================================================================

#[derive(Default)]
pub struct FakeImageServer {
  images: Mutex<BTreeMap<String, FileSystem>>,
  objects: Mutex<BTreeMap<ObjectHash, Vec<u8>>>,
  /// Number of `get_image` calls answered with "not ready" before images show
  pub not_ready: AtomicUsize,
  pub image_requests: AtomicUsize,
  pub fetches: AtomicUsize,
  pub fail_fetch: AtomicBool,
}

impl FakeImageServer {
  /// Scan `source` and publish it as image `name`, objects included
  pub fn publish(&self, name: &str, source: &Path) -> FileSystem {
    let fs = scanner::scan(source).expect("scan image source");
    let mut objects = self.objects.lock().unwrap();
    for (hash, paths) in fs.paths_by_hash() {
      let content = std::fs::read(source.join(paths[0])).expect("read image object");
      objects.insert(hash, content);
    }
    self.images.lock().unwrap().insert(name.to_string(), fs.clone());
    fs
  }
}

#[async_trait]
impl ImageSource for FakeImageServer {
  async fn get_image(&self, name: &str) -> Result<Option<Image>, ImageError> {
    self.image_requests.fetch_add(1, Ordering::SeqCst);
    let pending = self.not_ready.load(Ordering::SeqCst);
    if pending > 0 {
      self.not_ready.store(pending - 1, Ordering::SeqCst);
      return Ok(None);
    }
    Ok(
      self
        .images
        .lock()
        .unwrap()
        .get(name)
        .cloned()
        .map(|file_system| Image { file_system }),
    )
  }
}

#[async_trait]
impl ObjectFetcher for FakeImageServer {
  async fn fetch(&self, hash: ObjectHash, dest: &Path) -> Result<u64, ImageError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    if self.fail_fetch.load(Ordering::SeqCst) {
      return Err(ImageError::Status {
        status: 503,
        url: format!("/objects/{hash}"),
      });
    }
    let content = self
      .objects
      .lock()
      .unwrap()
      .get(&hash)
      .cloned()
      .ok_or(ImageError::ObjectNotFound { hash })?;
    tokio::fs::write(dest, &content).await.map_err(|source| ImageError::Io {
      path: dest.display().to_string(),
      source,
    })?;
    Ok(content.len() as u64)
  }
}

// ============================================================================
// Test context
// ============================================================================

pub struct UnpackerTestContext {
  pub state_dir: TempDir,
  pub config: Config,
  pub devices: Arc<FakeDevices>,
  pub partitioner: Arc<FakePartitioner>,
  pub mounter: Arc<FakeMounter>,
  pub boot: Arc<FakeBootMaker>,
  pub exporter: Arc<FakeExporter>,
  pub images: Arc<FakeImageServer>,
  pub cancel: CancellationToken,
}

impl UnpackerTestContext {
  pub fn new() -> Self {
    let state_dir = TempDir::new().expect("create state temp dir");
    let mut config = Config::default();
    config.unpacker.state_dir = state_dir.path().to_path_buf();
    // Fast polling for tests
    config.image.poll_initial_ms = 10;
    config.image.poll_step_ms = 10;
    config.image.poll_max_ms = 50;

    Self {
      state_dir,
      config,
      devices: Arc::default(),
      partitioner: Arc::default(),
      mounter: Arc::default(),
      boot: Arc::default(),
      exporter: Arc::default(),
      images: Arc::default(),
      cancel: CancellationToken::new(),
    }
  }

  pub fn host(&self) -> Host {
    Host {
      devices: self.devices.clone(),
      partitioner: self.partitioner.clone(),
      mounter: self.mounter.clone(),
      boot: self.boot.clone(),
      exporter: self.exporter.clone(),
    }
  }

  /// Load an Unpacker over the state directory, as the daemon does at start
  pub async fn load(&self) -> Unpacker {
    Unpacker::load(
      self.config.clone(),
      self.host(),
      self.images.clone(),
      self.images.clone(),
      self.cancel.child_token(),
    )
    .await
    .expect("load unpacker")
  }

  /// Environment for driving a `StreamActor` directly
  pub fn env(&self, shared: SharedStateRef) -> StreamEnv {
    StreamEnv {
      shared,
      host: self.host(),
      objects: self.images.clone(),
      config: Arc::new(self.config.clone()),
    }
  }

  pub fn mount_point(&self, stream: &str) -> PathBuf {
    self.config.unpacker.mount_root().join(stream.replace('/', "%2F"))
  }

  /// Run the two-phase add for a device that shows up as `name`
  pub async fn add_device(&self, unpacker: &Unpacker, id: &str, name: &str) {
    unpacker.prepare_for_add_device().await.expect("prepare for add device");
    self.devices.plug(name);
    unpacker.add_device(id).await.expect("add device");
  }

  /// Write a file under the stream's mount point
  pub fn write_device_file(&self, stream: &str, path: &str, content: &[u8]) {
    let full_path = self.mount_point(stream).join(path);
    if let Some(parent) = full_path.parent() {
      std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(full_path, content).expect("write file");
  }
}

/// Build an image tree under `root` from `(path, content)` pairs
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
  for (path, content) in files {
    let full_path = root.join(path);
    if let Some(parent) = full_path.parent() {
      std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(full_path, content).expect("write file");
  }
}

/// Wait for a condition to become true, with timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  let start = std::time::Instant::now();
  let poll_interval = Duration::from_millis(20);

  while start.elapsed() < timeout {
    if check().await {
      return true;
    }
    tokio::time::sleep(poll_interval).await;
  }
  false
}
