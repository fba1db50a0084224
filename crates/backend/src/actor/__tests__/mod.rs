//! Actor integration tests.
//!
//! Drive the Unpacker facade and the stream actors against in-memory host
//! and image server fakes.

mod devices;
mod guards;
pub(crate) mod helpers;
mod workflow;
