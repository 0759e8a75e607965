//! Queues over raw byte-stream descriptors (pipes, FIFOs, sockets, ttys).
//!
//! Each endpoint is single-direction: [`FdEnqueue`] writes frames,
//! [`FdDequeue`] reads them. A frame is the codec output followed by one
//! separator byte. Concurrent callers on one endpoint are serialized.

pub(crate) mod poll;
mod queue;
pub(crate) mod stream;

pub use queue::{FdDequeue, FdEnqueue};
