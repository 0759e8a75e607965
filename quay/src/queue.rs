//! Capability traits implemented by every transport.
//!
//! A transport implements [`Enqueue`], [`Dequeue`] or both. Code that only
//! holds an `impl Dequeue<T>` cannot reach the producing side.
//!
//! # Contract
//!
//! - An accepted message is never lost or duplicated by the queue itself.
//! - A timed operation that returns [`QueueError::TimedOut`] leaves the queue
//!   exactly as if it had not been called.
//! - Disabling a side is idempotent, level-triggered, and may race with any
//!   operation on that side: blocked callers return [`QueueError::Aborted`],
//!   later callers fail immediately with the same outcome until re-enabled.
//! - Disabling one side never discards queued messages.
//!
//! Transports implement the `*_with` methods; the plain and `*_timeout`
//! variants are provided.
//!
//! [`QueueError::TimedOut`]: crate::QueueError::TimedOut
//! [`QueueError::Aborted`]: crate::QueueError::Aborted

use std::time::Duration;

use crate::error::Result;
use crate::timeout::Timeout;

/// Producing side of a queue.
pub trait Enqueue<T> {
    /// Enqueues `value`, blocking at most `timeout` while the queue is full.
    ///
    /// # Errors
    ///
    /// `Aborted` if enqueueing is disabled, `TimedOut` if no room appeared in
    /// time, or a transport failure.
    fn enqueue_with(&self, value: T, timeout: Timeout) -> Result<()>;

    /// Blocks at most `timeout` until an enqueue would not block. Enqueues nothing.
    ///
    /// # Errors
    ///
    /// Same as [`Enqueue::enqueue_with`].
    fn wait_enqueueable_with(&self, timeout: Timeout) -> Result<()>;

    /// Disables (`true`) or re-enables (`false`) the producing side.
    fn disable_enqueue(&self, disable: bool);

    /// Enqueues `value`, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// See [`Enqueue::enqueue_with`].
    fn enqueue(&self, value: T) -> Result<()> {
        self.enqueue_with(value, Timeout::Infinite)
    }

    /// Enqueues `value`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Enqueue::enqueue_with`].
    fn enqueue_timeout(&self, value: T, timeout: Duration) -> Result<()> {
        self.enqueue_with(value, Timeout::Duration(timeout))
    }

    /// Blocks until an enqueue would not block.
    ///
    /// # Errors
    ///
    /// See [`Enqueue::enqueue_with`].
    fn wait_enqueueable(&self) -> Result<()> {
        self.wait_enqueueable_with(Timeout::Infinite)
    }

    /// Blocks until an enqueue would not block, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Enqueue::enqueue_with`].
    fn wait_enqueueable_timeout(&self, timeout: Duration) -> Result<()> {
        self.wait_enqueueable_with(Timeout::Duration(timeout))
    }
}

/// Consuming side of a queue.
pub trait Dequeue<T> {
    /// Removes the oldest message, blocking at most `timeout` while empty.
    ///
    /// # Errors
    ///
    /// `Aborted` if dequeueing is disabled, `TimedOut` if nothing arrived in
    /// time, or a transport failure.
    fn dequeue_with(&self, timeout: Timeout) -> Result<T>;

    /// Blocks at most `timeout` until a message is available. Removes nothing.
    ///
    /// # Errors
    ///
    /// Same as [`Dequeue::dequeue_with`].
    fn wait_dequeueable_with(&self, timeout: Timeout) -> Result<()>;

    /// Disables (`true`) or re-enables (`false`) the consuming side.
    fn disable_dequeue(&self, disable: bool);

    /// Removes the oldest message, blocking while empty.
    ///
    /// # Errors
    ///
    /// See [`Dequeue::dequeue_with`].
    fn dequeue(&self) -> Result<T> {
        self.dequeue_with(Timeout::Infinite)
    }

    /// Removes the oldest message, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Dequeue::dequeue_with`].
    fn dequeue_timeout(&self, timeout: Duration) -> Result<T> {
        self.dequeue_with(Timeout::Duration(timeout))
    }

    /// Blocks until a message is available.
    ///
    /// # Errors
    ///
    /// See [`Dequeue::dequeue_with`].
    fn wait_dequeueable(&self) -> Result<()> {
        self.wait_dequeueable_with(Timeout::Infinite)
    }

    /// Blocks until a message is available, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Dequeue::dequeue_with`].
    fn wait_dequeueable_timeout(&self, timeout: Duration) -> Result<()> {
        self.wait_dequeueable_with(Timeout::Duration(timeout))
    }
}
