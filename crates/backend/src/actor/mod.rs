//! Actor-based concurrency primitives
//!
//! Every stream has one long-lived actor task that owns the stream's runtime
//! state and runs its workflow steps one at a time. Shared registry state
//! lives behind a single lock that is only held for short lookups, updates
//! and checkpoint writes; it is never held across a mount, scan, fetch or
//! subprocess.
//!
//! # Actors
//!
//! - [`StreamActor`](stream::StreamActor): Per-stream worker (mount, scan,
//!   unpack, capture, copy, export)
//! - [`StreamRouter`]: Routes requests to StreamActors, spawning them on demand
//!
//! ```text
//! IPC Server -> Unpacker -> StreamRouter -> StreamActor -> [Host, ImageServer, Disk]
//!                                               |
//!                                               v
//!                                      Reply channel (oneshot)
//! ```

mod capture;
mod export;
pub mod handle;
pub mod lifecycle;
pub mod message;
mod router;
pub mod stream;
mod unpack;

#[cfg(test)]
pub(crate) mod __tests__;

pub use router::StreamRouter;
pub use stream::StreamEnv;
pub use unpack::IMAGE_NAME_FILE;
