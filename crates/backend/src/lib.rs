mod actor;
mod registry;
mod server;
mod state;
mod sync;
mod unpacker;

pub mod domain;
pub use domain::config;

pub mod dirs;
pub mod error;
pub mod host;
pub mod image;
pub mod ipc;

mod daemon;
pub use actor::message::UnpackReport;
pub use daemon::{Daemon, DaemonError, RuntimeConfig};
pub use error::{ErrorKind, UnpackerError};
pub use state::StreamStatusInfo;
pub use unpacker::{AddDeviceResult, DeviceStatus, Unpacker, UnpackerStatus};
