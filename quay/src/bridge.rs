//! Completion-callback operations on top of blocking queues.
//!
//! A [`QueueListener`] (dequeue side) or [`QueueSender`] (enqueue side) owns
//! one worker thread. Each `async_*` call queues an operation for that
//! thread, which performs the blocking call and posts the handler, with its
//! outcome, to a caller-owned [`Dispatcher`]. Handlers therefore always run
//! on whichever thread drives the dispatcher, never on the worker.
//!
//! Operations submitted to one bridge run one after another, in submission
//! order. Use one bridge per queue (or several bridges on one queue) for
//! concurrency.
//!
//! Every handler is invoked exactly once. If the bridge is dropped, queued
//! operations and the one in flight complete with
//! [`QueueError::Aborted`](crate::QueueError::Aborted).
//!
//! ```
//! use std::sync::Arc;
//! use quay::{Dispatcher, Enqueue, MemoryQueue, QueueListener};
//!
//! let queue = Arc::new(MemoryQueue::new(8));
//! let mut dispatcher = Dispatcher::new();
//! let listener = QueueListener::new(Arc::clone(&queue), dispatcher.handle()).unwrap();
//!
//! listener.async_dequeue(|result: quay::Result<u32>| {
//!     assert_eq!(result.unwrap(), 5);
//! });
//! queue.enqueue(5).unwrap();
//! assert_eq!(dispatcher.run(), 1);
//! ```

mod dispatch;
mod listener;
mod sender;
mod worker;

pub use dispatch::{DispatchHandle, Dispatcher};
pub use listener::QueueListener;
pub use sender::QueueSender;
