//! Bounded in-process FIFO guarded by a mutex and two condition variables.
//!
//! # Example
//!
//! ```
//! use quay::{Dequeue, Enqueue, MemoryQueue};
//!
//! let queue = MemoryQueue::new(16);
//! queue.enqueue("hello").unwrap();
//! assert_eq!(queue.dequeue().unwrap(), "hello");
//! ```

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{QueueError, Result};
use crate::queue::{Dequeue, Enqueue};
use crate::timeout::{Deadline, Timeout};

struct State<T> {
    items: VecDeque<T>,
    enq_enabled: bool,
    deq_enabled: bool,
    /// `0` = unbounded.
    capacity: usize,
    /// Set once the only producer is gone; drained consumers then see `Defunct`.
    closed: bool,
}

/// Thread-safe FIFO with an optional capacity bound.
///
/// Any number of threads may enqueue and dequeue concurrently. Enqueue blocks
/// while `len() == capacity()`, dequeue blocks while the queue is empty.
pub struct MemoryQueue<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> MemoryQueue<T> {
    /// Creates a queue holding at most `capacity` messages (`0` = unbounded).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                enq_enabled: true,
                deq_enabled: true,
                capacity,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Creates a queue without a capacity bound.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Maximum number of queued messages, `0` if unbounded.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Changes the capacity bound (`0` = unbounded).
    ///
    /// Producers blocked on a full queue re-check the new bound. Shrinking
    /// below the current length keeps every queued message; enqueues block
    /// until consumers drain below the new bound.
    pub fn set_capacity(&self, capacity: usize) {
        self.lock().capacity = capacity;
        self.not_full.notify_all();
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether no message is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Whether an enqueue would currently block.
    #[must_use]
    pub fn is_full(&self) -> bool {
        full(&self.lock())
    }

    /// Appends without waiting for room. Used by background producers that
    /// must never block on a slow consumer.
    pub(crate) fn push_unbounded(&self, value: T) {
        let mut state = self.lock();
        state.items.push_back(value);
        drop(state);
        self.not_empty.notify_all();
    }

    /// Marks the queue as abandoned by its producer and wakes all consumers.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_room(&self, timeout: Timeout) -> Result<MutexGuard<'_, State<T>>> {
        let deadline = timeout.start();
        let mut state = self.lock();
        loop {
            if !state.enq_enabled {
                return Err(QueueError::Aborted);
            }
            if state.closed {
                return Err(QueueError::Defunct);
            }
            if !full(&state) {
                return Ok(state);
            }
            state = park(&self.not_full, state, &deadline)?;
        }
    }

    fn wait_item(&self, timeout: Timeout) -> Result<MutexGuard<'_, State<T>>> {
        let deadline = timeout.start();
        let mut state = self.lock();
        loop {
            if !state.deq_enabled {
                return Err(QueueError::Aborted);
            }
            if !state.items.is_empty() {
                return Ok(state);
            }
            if state.closed {
                return Err(QueueError::Defunct);
            }
            state = park(&self.not_empty, state, &deadline)?;
        }
    }
}

/// Parks on `cond` until notified or `deadline` passes.
fn full<T>(state: &State<T>) -> bool {
    state.capacity != 0 && state.items.len() >= state.capacity
}

fn park<'a, S>(
    cond: &Condvar,
    guard: MutexGuard<'a, S>,
    deadline: &Deadline,
) -> Result<MutexGuard<'a, S>> {
    match deadline.remaining() {
        None => Ok(cond.wait(guard).unwrap_or_else(PoisonError::into_inner)),
        Some(left) if left.is_zero() => Err(QueueError::TimedOut),
        Some(left) => {
            let (guard, _) = cond
                .wait_timeout(guard, left)
                .unwrap_or_else(PoisonError::into_inner);
            Ok(guard)
        }
    }
}

impl<T> Enqueue<T> for MemoryQueue<T> {
    fn enqueue_with(&self, value: T, timeout: Timeout) -> Result<()> {
        let mut state = self.wait_room(timeout)?;
        state.items.push_back(value);
        drop(state);
        self.not_empty.notify_all();
        Ok(())
    }

    fn wait_enqueueable_with(&self, timeout: Timeout) -> Result<()> {
        self.wait_room(timeout).map(drop)
    }

    fn disable_enqueue(&self, disable: bool) {
        self.lock().enq_enabled = !disable;
        self.not_full.notify_all();
    }
}

impl<T> Dequeue<T> for MemoryQueue<T> {
    fn dequeue_with(&self, timeout: Timeout) -> Result<T> {
        let mut state = self.wait_item(timeout)?;
        let value = state.items.pop_front().ok_or(QueueError::Defunct)?;
        drop(state);
        self.not_full.notify_all();
        Ok(value)
    }

    fn wait_dequeueable_with(&self, timeout: Timeout) -> Result<()> {
        self.wait_item(timeout).map(drop)
    }

    fn disable_dequeue(&self, disable: bool) {
        self.lock().deq_enabled = !disable;
        self.not_empty.notify_all();
    }
}
