//! Device discovery, removal and association through the Unpacker facade.

#[cfg(test)]
mod tests {
  use std::{path::PathBuf, time::Duration};

  use pretty_assertions::assert_eq;

  use crate::{
    actor::__tests__::helpers::UnpackerTestContext,
    domain::stream::StreamStatus,
    error::ErrorKind,
    registry::StateStore,
  };

  // ==========================================================================
  // AddDevice
  // ==========================================================================

  #[tokio::test]
  async fn test_add_device_picks_the_new_device() {
    let ctx = UnpackerTestContext::new();
    ctx.devices.plug("sda");
    let unpacker = ctx.load().await;

    assert_eq!(unpacker.prepare_for_add_device().await.unwrap(), 1);
    ctx.devices.plug("sdb");
    let added = unpacker.add_device("dev0").await.expect("add device");

    assert_eq!(added.device_name, "sdb");
    assert_eq!(added.root_label, "rootfs@sdb");
    assert!(added.size_bytes > 0);
    assert_eq!(*ctx.partitioner.formatted.lock().unwrap(), vec![PathBuf::from("/dev/sdb")]);

    let status = unpacker.get_status().await;
    assert_eq!(status.devices["dev0"].device_name, "sdb");
    assert!(status.devices["dev0"].partitioned_at.is_some());
    assert_eq!(status.devices["dev0"].assigned_stream, None);

    // Checkpointed before returning
    let saved = StateStore::new(ctx.config.unpacker.state_file())
      .load()
      .unwrap()
      .expect("checkpoint written");
    assert_eq!(saved.devices["dev0"].device_name, "sdb");
  }

  #[tokio::test]
  async fn test_add_device_rejects_registered_name_before_formatting() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;
    ctx.add_device(&unpacker, "dev0", "sdb").await;

    // sdb is replugged while discovery runs and shows up as new again
    ctx.devices.unplug("sdb");
    unpacker.prepare_for_add_device().await.unwrap();
    ctx.devices.plug("sdb");
    let err = unpacker.add_device("dev1").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.to_string(), "device sdb already registered as: dev0");
    assert_eq!(*ctx.partitioner.formatted.lock().unwrap(), vec![PathBuf::from("/dev/sdb")]);
    assert!(unpacker.get_status().await.devices.get("dev1").is_none());
  }

  #[tokio::test]
  async fn test_add_device_without_new_device() {
    let ctx = UnpackerTestContext::new();
    ctx.devices.plug("sda");
    let unpacker = ctx.load().await;

    unpacker.prepare_for_add_device().await.unwrap();
    let err = unpacker.add_device("dev0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.to_string(), "no new devices found");
    assert!(ctx.partitioner.formatted.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_add_device_with_two_new_devices() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;

    unpacker.prepare_for_add_device().await.unwrap();
    ctx.devices.plug("sdb");
    ctx.devices.plug("sdc");
    let err = unpacker.add_device("dev0").await.unwrap_err();
    assert_eq!(err.to_string(), "too many new devices found");
    assert!(unpacker.get_status().await.devices.is_empty());
  }

  #[tokio::test]
  async fn test_add_device_requires_prepare() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;
    ctx.devices.plug("sdb");

    let err = unpacker.add_device("dev0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
  }

  #[tokio::test]
  async fn test_failed_add_keeps_snapshot_for_retry() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;

    unpacker.prepare_for_add_device().await.unwrap();
    assert!(unpacker.add_device("dev0").await.is_err());

    // The device shows up late; the same snapshot still applies
    ctx.devices.plug("sdb");
    assert_eq!(unpacker.add_device("dev0").await.unwrap().device_name, "sdb");

    // A successful add consumes the snapshot
    ctx.devices.plug("sdc");
    assert_eq!(
      unpacker.add_device("dev1").await.unwrap_err().kind(),
      ErrorKind::Validation
    );
  }

  #[tokio::test]
  async fn test_add_device_duplicate_id() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;
    ctx.add_device(&unpacker, "dev0", "sdb").await;

    unpacker.prepare_for_add_device().await.unwrap();
    ctx.devices.plug("sdc");
    let err = unpacker.add_device("dev0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.to_string(), "device ID: dev0 already exists");
    assert_eq!(ctx.partitioner.formatted.lock().unwrap().len(), 1, "sdc must not be formatted");
  }

  // ==========================================================================
  // RemoveDevice
  // ==========================================================================

  #[tokio::test]
  async fn test_remove_assigned_device_twice() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;
    ctx.add_device(&unpacker, "dev0", "sdb").await;
    unpacker.associate_stream_with_device("db1", "dev0").await.unwrap();

    let first = unpacker.remove_device("dev0").await.unwrap_err();
    let second = unpacker.remove_device("dev0").await.unwrap_err();

    assert_eq!(first.kind(), ErrorKind::Conflict);
    assert_eq!(first.to_string(), "device ID: dev0 used by: db1");
    assert_eq!(second.to_string(), first.to_string());
    assert!(unpacker.get_status().await.devices.contains_key("dev0"));
  }

  #[tokio::test]
  async fn test_remove_unassigned_device() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;
    ctx.add_device(&unpacker, "dev0", "sdb").await;

    unpacker.remove_device("dev0").await.expect("remove");
    assert!(unpacker.get_status().await.devices.is_empty());

    let err = unpacker.remove_device("dev0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_string(), "unknown device ID: dev0");
  }

  // ==========================================================================
  // AssociateStreamWithDevice
  // ==========================================================================

  #[tokio::test]
  async fn test_associate_with_any_device() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;
    ctx.add_device(&unpacker, "dev1", "sdc").await;
    ctx.add_device(&unpacker, "dev0", "sdb").await;

    // Lowest unused id wins
    assert_eq!(unpacker.associate_stream_with_device("db1", "").await.unwrap(), "dev0");
    // Already associated: no change
    assert_eq!(unpacker.associate_stream_with_device("db1", "").await.unwrap(), "dev0");

    let status = unpacker.get_status().await;
    assert_eq!(status.streams["db1"].status, StreamStatus::NotMounted);
    assert_eq!(status.streams["db1"].boot_label.as_deref(), Some("rootfs@sdb"));
    assert_eq!(status.devices["dev0"].assigned_stream.as_deref(), Some("db1"));
    assert_eq!(status.devices["dev1"].assigned_stream, None);
  }

  #[tokio::test]
  async fn test_associate_conflicts() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;
    ctx.add_device(&unpacker, "dev0", "sdb").await;
    unpacker.associate_stream_with_device("db1", "dev0").await.unwrap();

    let err = unpacker.associate_stream_with_device("db2", "dev0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.to_string(), "device ID: dev0 used by: db1");

    let err = unpacker.associate_stream_with_device("db2", "dev9").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_string(), "unknown device ID: dev9");

    let err = unpacker.associate_stream_with_device("db2", "").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let status = unpacker.get_status().await;
    assert_eq!(status.streams["db2"].status, StreamStatus::NoDevice);
    assert_eq!(status.devices["dev0"].assigned_stream.as_deref(), Some("db1"));
  }

  #[tokio::test]
  async fn test_reassociate_scanned_stream() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;
    ctx.add_device(&unpacker, "dev0", "sdb").await;
    ctx.add_device(&unpacker, "dev1", "sdc").await;
    unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
    ctx.write_device_file("db1", "etc/hostname", b"db1\n");

    assert_eq!(unpacker.associate_stream_with_device("db1", "dev1").await.unwrap(), "dev1");

    let status = unpacker.get_status().await;
    assert_eq!(status.streams["db1"].status, StreamStatus::NotMounted);
    assert!(!status.streams["db1"].has_file_system);
    assert_eq!(status.streams["db1"].boot_label.as_deref(), Some("rootfs@sdc"));
    assert_eq!(status.devices["dev0"].assigned_stream, None);
    assert!(!ctx.mounter.is_mounted(&ctx.mount_point("db1")));
    // The released device is not wiped
    assert!(ctx.mount_point("db1").join("etc/hostname").exists());
  }

  #[tokio::test]
  async fn test_foreign_label_is_not_reported() {
    let ctx = UnpackerTestContext::new();
    let unpacker = ctx.load().await;
    ctx.add_device(&unpacker, "dev0", "sdb").await;
    ctx.devices.set_label("sdb", "data");

    unpacker.associate_stream_with_device("db1", "dev0").await.unwrap();
    assert_eq!(unpacker.get_status().await.streams["db1"].boot_label, None);
  }

  // ==========================================================================
  // Restart
  // ==========================================================================

  #[tokio::test]
  async fn test_reload_restores_assignments() {
    let ctx = UnpackerTestContext::new();
    {
      let unpacker = ctx.load().await;
      ctx.add_device(&unpacker, "dev0", "sdb").await;
      ctx.add_device(&unpacker, "dev1", "sdc").await;
      unpacker.prepare_for_unpack("db1", false, false).await.unwrap();
      unpacker.shutdown().await;
    }
    assert!(
      !ctx.mounter.is_mounted(&ctx.mount_point("db1")),
      "shutdown should unmount"
    );

    let unpacker = ctx.load().await;
    let status = unpacker.get_status().await;
    assert_eq!(status.devices.len(), 2);
    assert!(status.devices["dev0"].size_bytes > 0, "size is re-read on load");
    assert_eq!(status.streams["db1"].assigned_device.as_deref(), Some("dev0"));
    assert_eq!(status.streams["db1"].status, StreamStatus::NotMounted);
    assert!(!status.streams["db1"].has_file_system);
    assert!(status.time_since_last_activity() < Duration::from_secs(60));
  }
}
