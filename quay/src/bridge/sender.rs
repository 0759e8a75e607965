//! Enqueue side of the bridge.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::dispatch::DispatchHandle;
use super::worker::{Worker, submit_op};
use crate::error::{BuildError, Result};
use crate::queue::Enqueue;
use crate::timeout::Timeout;

/// Asynchronous enqueue side of a queue.
///
/// The value travels with the operation to the worker thread, so `T` must
/// be `Send`. A value whose operation is aborted is dropped.
pub struct QueueSender<Q, T> {
    worker: Worker<Q>,
    dispatch: DispatchHandle,
    _marker: PhantomData<fn(T)>,
}

impl<Q, T> QueueSender<Q, T>
where
    Q: Enqueue<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Starts the worker thread for `queue`; handlers are posted to `dispatch`.
    ///
    /// # Errors
    ///
    /// [`BuildError::Spawn`] if the worker thread cannot be started.
    pub fn new(queue: Arc<Q>, dispatch: DispatchHandle) -> std::result::Result<Self, BuildError> {
        Ok(Self {
            worker: Worker::spawn(queue, "sender")?,
            dispatch,
            _marker: PhantomData,
        })
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<Q> {
        self.worker.queue()
    }

    /// Enqueues `value` on the worker and posts `handler` with the outcome.
    pub fn async_enqueue(&self, value: T, handler: impl FnOnce(Result<()>) + Send + 'static) {
        self.submit_enqueue(value, Timeout::Infinite, handler);
    }

    pub fn async_enqueue_timeout(
        &self,
        value: T,
        timeout: Duration,
        handler: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.submit_enqueue(value, Timeout::Duration(timeout), handler);
    }

    /// Waits on the worker until an enqueue would not block.
    pub fn async_wait_enqueue(&self, handler: impl FnOnce(Result<()>) + Send + 'static) {
        self.submit_wait(Timeout::Infinite, handler);
    }

    pub fn async_wait_enqueue_timeout(
        &self,
        timeout: Duration,
        handler: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.submit_wait(Timeout::Duration(timeout), handler);
    }

    /// Enqueues on the calling thread, bypassing the worker.
    ///
    /// # Errors
    ///
    /// See [`Enqueue::enqueue`].
    pub fn sync_enqueue(&self, value: T) -> Result<()> {
        self.queue().enqueue(value)
    }

    /// Stops accepting operations and blocks until the queued ones complete.
    pub fn shutdown(mut self) {
        self.worker.shutdown();
    }

    fn submit_enqueue(
        &self,
        value: T,
        timeout: Timeout,
        handler: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        submit_op(&self.worker, &self.dispatch, handler, move |queue: &Q| {
            queue.enqueue_with(value, timeout)
        });
    }

    fn submit_wait(&self, timeout: Timeout, handler: impl FnOnce(Result<()>) + Send + 'static) {
        submit_op(&self.worker, &self.dispatch, handler, move |queue: &Q| {
            queue.wait_enqueueable_with(timeout)
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bridge::Dispatcher;
    use crate::memory::MemoryQueue;
    use crate::queue::Dequeue;

    #[test]
    fn enqueues_in_submission_order() {
        let queue = Arc::new(MemoryQueue::new(8));
        let mut dispatcher = Dispatcher::new();
        let sender = QueueSender::new(Arc::clone(&queue), dispatcher.handle()).unwrap();

        for i in 0..5u32 {
            sender.async_enqueue(i, |r| r.unwrap());
        }
        assert_eq!(dispatcher.run(), 5);
        for i in 0..5 {
            assert_eq!(queue.dequeue().unwrap(), i);
        }
    }

    #[test]
    fn full_queue_times_out_then_wait_succeeds() {
        let queue = Arc::new(MemoryQueue::new(1));
        let mut dispatcher = Dispatcher::new();
        let sender = QueueSender::new(Arc::clone(&queue), dispatcher.handle()).unwrap();
        sender.sync_enqueue(1u8).unwrap();

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        {
            let outcomes = Arc::clone(&outcomes);
            sender.async_enqueue_timeout(2, Duration::from_millis(10), move |r| {
                outcomes.lock().unwrap().push(r.unwrap_err().is_timeout());
            });
        }
        assert_eq!(dispatcher.run(), 1);

        {
            let outcomes = Arc::clone(&outcomes);
            sender.async_wait_enqueue(move |r| outcomes.lock().unwrap().push(r.is_ok()));
        }
        assert_eq!(queue.dequeue().unwrap(), 1);
        assert_eq!(dispatcher.run(), 1);
        assert_eq!(*outcomes.lock().unwrap(), [true, true]);
        assert!(queue.is_empty());
    }

    #[test]
    fn disabled_queue_reports_aborted() {
        let queue = Arc::new(MemoryQueue::<u8>::new(1));
        queue.disable_enqueue(true);
        let mut dispatcher = Dispatcher::new();
        let sender = QueueSender::new(queue, dispatcher.handle()).unwrap();
        let aborted = Arc::new(Mutex::new(false));
        {
            let aborted = Arc::clone(&aborted);
            sender.async_enqueue(1, move |r| *aborted.lock().unwrap() = r.unwrap_err().is_aborted());
        }
        sender.shutdown();
        assert_eq!(dispatcher.run(), 1);
        assert!(*aborted.lock().unwrap());
    }
}
