//! Message queues with one blocking contract over several transports.
//!
//! Every transport implements [`Enqueue`], [`Dequeue`] or both:
//!
//! | Transport | Enqueue | Dequeue | Medium |
//! |-----------|---------|---------|--------|
//! | [`MemoryQueue`] | yes | yes | in-process buffer |
//! | [`DirQueue`] | yes | yes | one file per message, shared across processes |
//! | [`FdEnqueue`] / [`FdDequeue`] | one side each | | byte-stream descriptor |
//! | [`ServerQueue`] / [`ClientQueue`] | yes | yes | single TCP connection |
//! | [`CollectorQueue`] | | yes | many TCP clients fanned in |
//!
//! The [`bridge`] module runs the blocking calls on a worker thread and
//! delivers completions to a caller-owned [`Dispatcher`].

pub mod bridge;
pub mod codec;
pub mod dirq;
pub mod error;
pub mod fd;
pub mod ipc;
pub mod memory;
pub mod net;
pub mod queue;
pub mod timeout;
mod trace;

pub use bridge::{Dispatcher, QueueListener, QueueSender};
pub use codec::{Codec, CodecError, DEFAULT_SEPARATOR, FnCodec, PostcardCodec, TextCodec};
pub use dirq::{DirQueue, DirQueueConfig};
pub use error::{BuildError, QueueError, Result};
pub use fd::{FdDequeue, FdEnqueue};
pub use memory::MemoryQueue;
pub use net::{
    ClientConfig, ClientQueue, CollectorConfig, CollectorQueue, Endpoint, ServerConfig,
    ServerQueue,
};
pub use queue::{Dequeue, Enqueue};
pub use timeout::Timeout;
pub use trace::init_tracing;
