//! Unpack, capture, copy and export workflows end to end.

#[cfg(test)]
mod tests {
  use std::{
    path::PathBuf,
    sync::atomic::Ordering,
    time::Duration,
  };

  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use crate::{
    actor::{
      IMAGE_NAME_FILE,
      __tests__::helpers::{UnpackerTestContext, wait_for, write_tree},
    },
    domain::{config::RESERVED_DIR, filesystem::FileSystem, stream::StreamStatus},
    error::ErrorKind,
    sync::scanner,
    unpacker::Unpacker,
  };

  const IMAGE_FILES: &[(&str, &[u8])] = &[
    ("etc/hostname", b"db1\n"),
    ("etc/motd", b"welcome\n"),
    ("usr/bin/tool", b"#!/bin/sh\necho tool\n"),
    ("boot/vmlinuz-6.1", b"kernel"),
  ];

  /// A loaded Unpacker with `dev0` (sdb) and image `db1/v1` published
  async fn setup() -> (UnpackerTestContext, Unpacker, FileSystem, TempDir) {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;
    ctx.add_device(&unpacker, "dev0", "sdb").await;

    let source = TempDir::new().unwrap();
    write_tree(source.path(), IMAGE_FILES);
    let desired = ctx.images.publish("db1/v1", source.path());
    (ctx, unpacker, desired, source)
  }

  async fn status_of(unpacker: &Unpacker, stream: &str) -> StreamStatus {
    unpacker.get_status().await.streams[stream].status
  }

  fn paths(fs: &FileSystem) -> Vec<String> {
    fs.entries.keys().cloned().collect()
  }

  // ==========================================================================
  // PrepareForUnpack
  // ==========================================================================

  #[tokio::test]
  async fn test_prepare_for_unpack_auto_assigns_device() {
    let (ctx, unpacker, _, _source) = setup().await;

    unpacker.prepare_for_unpack("db1", false, false).await.expect("prepare");

    let status = unpacker.get_status().await;
    assert_eq!(status.streams["db1"].status, StreamStatus::Scanned);
    assert_eq!(status.streams["db1"].assigned_device.as_deref(), Some("dev0"));
    assert!(status.streams["db1"].has_file_system);
    assert_eq!(status.devices["dev0"].assigned_stream.as_deref(), Some("db1"));
    assert!(ctx.mounter.is_mounted(&ctx.mount_point("db1")));
    assert!(ctx.mount_point("db1").join(RESERVED_DIR).join("objects").is_dir());
  }

  #[tokio::test]
  async fn test_prepare_for_unpack_without_free_device() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;

    let err = unpacker.prepare_for_unpack("db1", false, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.to_string(), "no available device");
    assert_eq!(status_of(&unpacker, "db1").await, StreamStatus::NoDevice);
  }

  #[tokio::test]
  async fn test_scan_sees_device_contents() {
    let (ctx, unpacker, _, _source) = setup().await;
    ctx.write_device_file("db1", "etc/hostname", b"old\n");
    ctx.write_device_file("db1", "var/log/messages", b"");

    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();

    let fs = unpacker.get_file_system("db1").await.unwrap().expect("scanned");
    assert_eq!(paths(&fs), vec!["etc", "etc/hostname", "var", "var/log", "var/log/messages"]);
  }

  #[tokio::test]
  async fn test_skip_if_scanned_keeps_previous_scan() {
    let (ctx, unpacker, _, _source) = setup().await;
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
    ctx.write_device_file("db1", "new-file", b"new");

    unpacker.prepare_for_unpack("db1", true, false).await.unwrap();
    let fs = unpacker.get_file_system("db1").await.unwrap().unwrap();
    assert!(fs.inode("new-file").is_none());

    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
    let fs = unpacker.get_file_system("db1").await.unwrap().unwrap();
    assert!(fs.inode("new-file").is_some());
  }

  #[tokio::test]
  async fn test_prepare_for_unpack_without_waiting() {
    let (_ctx, unpacker, _, _source) = setup().await;

    unpacker.prepare_for_unpack("db1", false, true).await.expect("queued");

    assert!(
      wait_for(Duration::from_secs(5), || async {
        status_of(&unpacker, "db1").await == StreamStatus::Scanned
      })
      .await,
      "background scan should complete"
    );
  }

  #[tokio::test]
  async fn test_requests_run_in_arrival_order() {
    let (_ctx, unpacker, _, _source) = setup().await;

    // The unpack is queued behind the background scan and sees its result
    unpacker.prepare_for_unpack("db1", false, true).await.unwrap();
    let report = unpacker.unpack_image("db1", "v1").await.expect("unpack after scan");
    assert_eq!(report.image_name, "db1/v1");
  }

  #[tokio::test]
  async fn test_get_file_system_unknown_stream() {
    let (_ctx, unpacker, _, _source) = setup().await;
    let err = unpacker.get_file_system("nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
  }

  // ==========================================================================
  // UnpackImage
  // ==========================================================================

  #[tokio::test]
  async fn test_unpack_image_onto_stale_device() {
    let (ctx, unpacker, desired, _source) = setup().await;
    ctx.write_device_file("db1", "etc/hostname", b"db1\n");
    ctx.write_device_file("db1", "etc/stale", b"remove me");
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();

    let report = unpacker.unpack_image("db1", "v1").await.expect("unpack");

    assert_eq!(report.image_name, "db1/v1");
    assert_eq!(report.deleted, 1);
    // etc/hostname was already on the device
    assert_eq!(report.fetched_objects, 3);
    assert_eq!(report.fetched_bytes, (8 + 20 + 6) as u64);

    let root = ctx.mount_point("db1");
    assert_eq!(paths(&scanner::scan(&root).unwrap()), paths(&desired));
    assert_eq!(std::fs::read(root.join("etc/motd")).unwrap(), b"welcome\n");
    assert_eq!(
      std::fs::read_to_string(root.join(RESERVED_DIR).join(IMAGE_NAME_FILE)).unwrap(),
      "db1/v1\n"
    );

    let status = unpacker.get_status().await;
    assert_eq!(status.streams["db1"].status, StreamStatus::Mounted);
    assert!(!status.streams["db1"].has_file_system, "unpack consumes the scan");
  }

  #[tokio::test]
  async fn test_unpack_same_image_twice() {
    let (ctx, unpacker, desired, _source) = setup().await;
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
    unpacker.unpack_image("db1", "v1").await.unwrap();
    let fetches = ctx.images.fetches.load(Ordering::SeqCst);

    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
    let report = unpacker.unpack_image("db1", "v1").await.unwrap();

    assert_eq!(report.deleted, 0);
    assert_eq!(report.fetched_objects, 0);
    assert_eq!(report.update.created, 0);
    assert_eq!(report.update.removed, 0);
    assert_eq!(ctx.images.fetches.load(Ordering::SeqCst), fetches);
    assert_eq!(paths(&scanner::scan(&ctx.mount_point("db1")).unwrap()), paths(&desired));
  }

  #[tokio::test]
  async fn test_unpack_waits_for_image() {
    let (ctx, unpacker, _, _source) = setup().await;
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
    ctx.images.not_ready.store(2, Ordering::SeqCst);

    unpacker.unpack_image("db1", "v1").await.expect("unpack");
    assert_eq!(ctx.images.image_requests.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_unpack_requires_scan() {
    let (_ctx, unpacker, _, _source) = setup().await;
    unpacker.associate_stream_with_device("db1", "dev0").await.unwrap();

    let err = unpacker.unpack_image("db1", "v1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(status_of(&unpacker, "db1").await, StreamStatus::NotMounted);
  }

  #[tokio::test]
  async fn test_unpack_unknown_stream() {
    let (_ctx, unpacker, _, _source) = setup().await;
    let err = unpacker.unpack_image("db9", "v1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_string(), "unknown stream: db9");
  }

  #[tokio::test]
  async fn test_fetch_failure_reverts_to_mounted() {
    let (ctx, unpacker, _, _source) = setup().await;
    ctx.write_device_file("db1", "etc/stale", b"remove me");
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
    ctx.images.fail_fetch.store(true, Ordering::SeqCst);

    let err = unpacker.unpack_image("db1", "v1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Image);

    let status = unpacker.get_status().await;
    assert_eq!(status.streams["db1"].status, StreamStatus::Mounted);
    assert!(!status.streams["db1"].has_file_system);
    // Deletion happens before fetching and is not undone
    assert!(!ctx.mount_point("db1").join("etc/stale").exists());

    // Recovery is a fresh scan then unpack
    ctx.images.fail_fetch.store(false, Ordering::SeqCst);
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
    unpacker.unpack_image("db1", "v1").await.expect("retry");
  }

  // ==========================================================================
  // PrepareForCapture / PrepareForCopy
  // ==========================================================================

  #[tokio::test]
  async fn test_prepare_for_capture_after_unpack() {
    let (ctx, unpacker, _, _source) = setup().await;
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
    unpacker.unpack_image("db1", "v1").await.unwrap();

    unpacker.prepare_for_capture("db1").await.expect("capture");

    assert_eq!(status_of(&unpacker, "db1").await, StreamStatus::NotMounted);
    let calls = ctx.boot.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].device_node, PathBuf::from("/dev/sdb"));
    assert_eq!(calls[0].root_label, "rootfs@sdb");
    assert_eq!(calls[0].kernel_options, ctx.config.capture.kernel_options);
    assert_eq!(calls[0].boot_entries, vec!["boot", "boot/vmlinuz-6.1"]);

    let root = ctx.mount_point("db1");
    assert!(!root.join(RESERVED_DIR).exists(), "debris is removed");
    assert!(!ctx.mounter.is_mounted(&root));
    assert_eq!(ctx.mounter.syncs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_capture_mounts_an_unmounted_stream() {
    let (ctx, unpacker, _, _source) = setup().await;
    unpacker.associate_stream_with_device("db1", "dev0").await.unwrap();

    unpacker.prepare_for_capture("db1").await.expect("capture");
    assert_eq!(ctx.mounter.mounts.load(Ordering::SeqCst), 1);
    assert_eq!(status_of(&unpacker, "db1").await, StreamStatus::NotMounted);
  }

  #[tokio::test]
  async fn test_capture_failure_stays_mounted() {
    let (ctx, unpacker, _, _source) = setup().await;
    unpacker.associate_stream_with_device("db1", "dev0").await.unwrap();
    ctx.boot.fail.store(true, Ordering::SeqCst);

    let err = unpacker.prepare_for_capture("db1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Host);
    assert_eq!(status_of(&unpacker, "db1").await, StreamStatus::Mounted);
    assert!(ctx.mounter.is_mounted(&ctx.mount_point("db1")));
  }

  #[tokio::test]
  async fn test_capture_rejected_while_scanned() {
    let (ctx, unpacker, _, _source) = setup().await;
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();

    let err = unpacker.prepare_for_capture("db1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(err.to_string(), "stream not idle");
    assert_eq!(status_of(&unpacker, "db1").await, StreamStatus::Scanned);
    assert!(ctx.boot.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_capture_unknown_stream() {
    let (_ctx, unpacker, _, _source) = setup().await;
    assert_eq!(
      unpacker.prepare_for_capture("db9").await.unwrap_err().kind(),
      ErrorKind::NotFound
    );
  }

  #[tokio::test]
  async fn test_prepare_for_copy_unmounts() {
    let (ctx, unpacker, _, _source) = setup().await;
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();

    unpacker.prepare_for_copy("db1").await.expect("copy");
    assert_eq!(status_of(&unpacker, "db1").await, StreamStatus::NotMounted);
    assert!(!ctx.mounter.is_mounted(&ctx.mount_point("db1")));

    // Already unmounted is fine
    unpacker.prepare_for_copy("db1").await.expect("copy again");
    assert_eq!(ctx.mounter.unmounts.load(Ordering::SeqCst), 1);
  }

  // ==========================================================================
  // ExportImage
  // ==========================================================================

  #[tokio::test]
  async fn test_export_scanned_stream() {
    let (ctx, unpacker, _, _source) = setup().await;
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();

    unpacker
      .export_image("db1", "aws", "ami-db1")
      .await
      .expect("export");

    let calls = ctx.exporter.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].device_node, PathBuf::from("/dev/sdb"));
    assert_eq!(calls[0].export_type, "aws");
    assert_eq!(calls[0].destination, "ami-db1");
    assert_eq!(status_of(&unpacker, "db1").await, StreamStatus::NotMounted);
    assert!(!ctx.mounter.is_mounted(&ctx.mount_point("db1")));
  }

  #[tokio::test]
  async fn test_export_failure_ends_not_mounted() {
    let (ctx, unpacker, _, _source) = setup().await;
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
    ctx.exporter.fail.store(true, Ordering::SeqCst);

    let err = unpacker.export_image("db1", "aws", "ami-db1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Host);
    assert!(err.to_string().contains("upload refused"));
    assert_eq!(status_of(&unpacker, "db1").await, StreamStatus::NotMounted);
  }

  #[tokio::test]
  async fn test_export_allocates_device_for_new_stream() {
    let (ctx, unpacker, _, _source) = setup().await;

    unpacker.export_image("db2", "aws", "ami-db2").await.expect("export");
    let status = unpacker.get_status().await;
    assert_eq!(status.streams["db2"].assigned_device.as_deref(), Some("dev0"));
    assert_eq!(ctx.mounter.mounts.load(Ordering::SeqCst), 0);
  }
}
