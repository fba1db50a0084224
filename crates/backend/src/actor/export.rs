//! Export workflow: stream the raw device through the export tool.

use std::time::Instant;

use tracing::info;

use super::stream::StreamActor;
use crate::{
  domain::stream::{StreamOp, StreamStatus},
  error::UnpackerError,
};

impl StreamActor {
  /// Unmount if needed and run the export tool over the device. The stream
  /// is `Exporting` while the tool runs and `NotMounted` afterwards, whatever
  /// the outcome.
  pub(super) async fn export(&mut self, export_type: &str, destination: &str) -> Result<(), UnpackerError> {
    self.status.check_busy(StreamOp::Export)?;
    let (_, device) = self.ensure_device().await?;
    if self.status.check_export()? {
      self.unmount().await?;
    }

    let device_node = self.env.host.devices.device_node(&device.device_name);
    self.set_status(StreamStatus::Exporting).await;
    let start = Instant::now();
    let result = self
      .env
      .host
      .exporter
      .export(&device_node, export_type, destination)
      .await;
    self.set_status(StreamStatus::NotMounted).await;
    result?;

    info!(
      stream = %self.name,
      export_type,
      destination,
      elapsed_ms = start.elapsed().as_millis() as u64,
      "Exported"
    );
    Ok(())
  }
}
