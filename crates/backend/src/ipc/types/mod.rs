//! IPC types - unified request/response types with conversions
//!
//! Each area has its own module containing:
//! - Request types (input parameters)
//! - Response types (output data)
//! - `IpcRequest` wiring for typed client calls

pub mod device;
pub mod stream;
pub mod system;
