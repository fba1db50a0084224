//! CLI command implementations

mod daemon;
mod device;
mod status;
mod stream;

pub use daemon::{cmd_daemon, cmd_daemon_spawn, cmd_stop};
pub use device::{cmd_add_device, cmd_remove_device};
pub use status::cmd_status;
pub use stream::{
  cmd_associate, cmd_export, cmd_filesystem, cmd_prepare_capture, cmd_prepare_copy, cmd_prepare_unpack, cmd_unpack,
};
