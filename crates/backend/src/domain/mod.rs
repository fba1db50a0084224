//! Domain types - core business entities
//!
//! These types describe devices, streams and filesystem trees independently
//! of persistence or IPC concerns.

pub mod config;
pub mod device;
pub mod filesystem;
pub mod stream;
