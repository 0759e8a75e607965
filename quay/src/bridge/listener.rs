//! Dequeue side of the bridge.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::dispatch::DispatchHandle;
use super::worker::{Worker, submit_op};
use crate::error::{BuildError, Result};
use crate::queue::Dequeue;
use crate::timeout::Timeout;

/// Asynchronous dequeue side of a queue.
///
/// Handlers receive `Ok(value)`, or the same errors the blocking call
/// would have returned, plus [`QueueError::Aborted`](crate::QueueError::Aborted)
/// if the listener is dropped before the operation completes.
pub struct QueueListener<Q, T> {
    worker: Worker<Q>,
    dispatch: DispatchHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<Q, T> QueueListener<Q, T>
where
    Q: Dequeue<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Starts the worker thread for `queue`; handlers are posted to `dispatch`.
    ///
    /// # Errors
    ///
    /// [`BuildError::Spawn`] if the worker thread cannot be started.
    pub fn new(queue: Arc<Q>, dispatch: DispatchHandle) -> std::result::Result<Self, BuildError> {
        Ok(Self {
            worker: Worker::spawn(queue, "listener")?,
            dispatch,
            _marker: PhantomData,
        })
    }

    /// The wrapped queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<Q> {
        self.worker.queue()
    }

    /// Dequeues a value on the worker and posts `handler` with it.
    pub fn async_dequeue(&self, handler: impl FnOnce(Result<T>) + Send + 'static) {
        self.submit_dequeue(Timeout::Infinite, handler);
    }

    /// Like [`QueueListener::async_dequeue`] but gives up after `timeout`.
    pub fn async_dequeue_timeout(
        &self,
        timeout: Duration,
        handler: impl FnOnce(Result<T>) + Send + 'static,
    ) {
        self.submit_dequeue(Timeout::Duration(timeout), handler);
    }

    /// Waits on the worker until a value is available, without taking it.
    pub fn async_wait_dequeue(&self, handler: impl FnOnce(Result<()>) + Send + 'static) {
        self.submit_wait(Timeout::Infinite, handler);
    }

    /// Like [`QueueListener::async_wait_dequeue`] but gives up after `timeout`.
    pub fn async_wait_dequeue_timeout(
        &self,
        timeout: Duration,
        handler: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.submit_wait(Timeout::Duration(timeout), handler);
    }

    /// Dequeues on the calling thread, bypassing the worker.
    ///
    /// # Errors
    ///
    /// See [`Dequeue::dequeue`].
    pub fn sync_dequeue(&self) -> Result<T> {
        self.queue().dequeue()
    }

    /// Stops accepting operations and blocks until the queued ones complete.
    ///
    /// Operations blocked on an empty queue keep the worker busy; disable the
    /// queue's dequeue side first to abort them.
    pub fn shutdown(mut self) {
        self.worker.shutdown();
    }

    fn submit_dequeue(&self, timeout: Timeout, handler: impl FnOnce(Result<T>) + Send + 'static) {
        submit_op(&self.worker, &self.dispatch, handler, move |queue: &Q| {
            queue.dequeue_with(timeout)
        });
    }

    fn submit_wait(&self, timeout: Timeout, handler: impl FnOnce(Result<()>) + Send + 'static) {
        submit_op(&self.worker, &self.dispatch, handler, move |queue: &Q| {
            queue.wait_dequeueable_with(timeout)
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;

    use super::*;
    use crate::bridge::Dispatcher;
    use crate::memory::MemoryQueue;
    use crate::queue::Enqueue;

    #[test]
    fn handlers_receive_values_in_submission_order() {
        let queue = Arc::new(MemoryQueue::new(4));
        let mut dispatcher = Dispatcher::new();
        let listener = QueueListener::new(Arc::clone(&queue), dispatcher.handle()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            listener.async_dequeue(move |r: Result<u32>| {
                seen.lock().unwrap().push((tag, r.unwrap()));
            });
        }
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();

        assert_eq!(dispatcher.run(), 2);
        assert_eq!(*seen.lock().unwrap(), [("a", 1), ("b", 2)]);
    }

    #[test]
    fn handler_runs_on_the_dispatcher_thread() {
        let queue = Arc::new(MemoryQueue::new(1));
        queue.enqueue(9u8).unwrap();
        let mut dispatcher = Dispatcher::new();
        let listener = QueueListener::new(queue, dispatcher.handle()).unwrap();
        let me = thread::current().id();
        listener.async_dequeue(move |r| {
            assert_eq!(r.unwrap(), 9);
            assert_eq!(thread::current().id(), me);
        });
        assert!(dispatcher.run_one());
    }

    #[test]
    fn timeout_and_wait_outcomes() {
        let queue = Arc::new(MemoryQueue::<u8>::new(1));
        let mut dispatcher = Dispatcher::new();
        let listener = QueueListener::new(Arc::clone(&queue), dispatcher.handle()).unwrap();
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        {
            let outcomes = Arc::clone(&outcomes);
            listener.async_dequeue_timeout(Duration::from_millis(10), move |r| {
                outcomes.lock().unwrap().push(r.unwrap_err().is_timeout());
            });
        }
        {
            let outcomes = Arc::clone(&outcomes);
            listener.async_wait_dequeue_timeout(Duration::from_secs(5), move |r| {
                outcomes.lock().unwrap().push(r.is_ok());
            });
        }
        thread::sleep(Duration::from_millis(30));
        queue.enqueue(1).unwrap();
        assert_eq!(dispatcher.run(), 2);
        assert_eq!(*outcomes.lock().unwrap(), [true, true]);
        // The wait did not consume.
        assert_eq!(listener.sync_dequeue().unwrap(), 1);
    }

    #[test]
    fn dropping_the_listener_aborts_blocked_operation() {
        let queue = Arc::new(MemoryQueue::<u8>::new(1));
        let mut dispatcher = Dispatcher::new();
        let listener = QueueListener::new(Arc::clone(&queue), dispatcher.handle()).unwrap();
        let aborted = Arc::new(Mutex::new(false));
        {
            let aborted = Arc::clone(&aborted);
            listener.async_dequeue(move |r| *aborted.lock().unwrap() = r.unwrap_err().is_aborted());
        }
        thread::sleep(Duration::from_millis(20));
        drop(listener);
        // Unblock the detached worker; its result is discarded.
        queue.enqueue(1).unwrap();
        assert_eq!(dispatcher.run(), 1);
        assert!(*aborted.lock().unwrap());
    }

    #[test]
    fn shutdown_completes_queued_operations() {
        let queue = Arc::new(MemoryQueue::new(4));
        queue.enqueue(3u16).unwrap();
        let mut dispatcher = Dispatcher::new();
        let listener = QueueListener::new(queue, dispatcher.handle()).unwrap();
        let got = Arc::new(Mutex::new(None));
        {
            let got = Arc::clone(&got);
            listener.async_dequeue(move |r| *got.lock().unwrap() = Some(r.unwrap()));
        }
        listener.shutdown();
        assert_eq!(dispatcher.poll(), 1);
        assert_eq!(*got.lock().unwrap(), Some(3));
    }
}
