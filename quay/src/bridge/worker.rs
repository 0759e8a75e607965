//! The worker thread behind a bridge and the operations it runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use super::dispatch::{DispatchHandle, Work};
use crate::error::{BuildError, QueueError, Result};
use crate::trace::{debug, info};

/// Set once the owning bridge is dropped.
#[derive(Clone)]
pub(crate) struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub(crate) fn is_alive(&self) -> bool {
        !self.0.load(Ordering::Acquire)
    }
}

type Job<Q> = Box<dyn FnOnce(&Q, &Liveness) + Send>;

/// Pending completion of one asynchronous operation.
///
/// Completing it posts the handler with the outcome. Dropping it without
/// completing posts the handler with [`QueueError::Aborted`].
pub(crate) struct Pending<R: Send + 'static> {
    handler: Option<Box<dyn FnOnce(Result<R>) + Send>>,
    work: Option<Work>,
}

impl<R: Send + 'static> Pending<R> {
    pub(crate) fn new(
        dispatch: &DispatchHandle,
        handler: impl FnOnce(Result<R>) + Send + 'static,
    ) -> Self {
        Self {
            handler: Some(Box::new(handler)),
            work: Some(dispatch.work()),
        }
    }

    pub(crate) fn complete(mut self, result: Result<R>) {
        self.post(result);
    }

    fn post(&mut self, result: Result<R>) {
        if let (Some(handler), Some(work)) = (self.handler.take(), self.work.take()) {
            work.post(move || handler(result));
        }
    }
}

impl<R: Send + 'static> Drop for Pending<R> {
    fn drop(&mut self) {
        self.post(Err(QueueError::Aborted));
    }
}

/// One thread running the jobs of a bridge in submission order.
pub(crate) struct Worker<Q> {
    queue: Arc<Q>,
    jobs: Option<Sender<Job<Q>>>,
    torn_down: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<Q: Send + Sync + 'static> Worker<Q> {
    pub(crate) fn spawn(queue: Arc<Q>, name: &'static str) -> std::result::Result<Self, BuildError> {
        let (tx, rx) = mpsc::channel::<Job<Q>>();
        let torn_down = Arc::new(AtomicBool::new(false));
        let liveness = Liveness(Arc::clone(&torn_down));
        let target = Arc::clone(&queue);

        debug!(name, "spawning bridge worker");
        let handle = thread::Builder::new()
            .name(format!("quay-{name}"))
            .spawn(move || {
                info!("bridge worker started");
                for job in rx {
                    job(&target, &liveness);
                }
                info!("bridge worker exiting");
            })
            .map_err(|source| BuildError::Spawn { name, source })?;

        Ok(Self {
            queue,
            jobs: Some(tx),
            torn_down,
            handle: Some(handle),
        })
    }

    pub(crate) fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Queues a job. If the worker is gone the job is dropped, which aborts
    /// any [`Pending`] it owns.
    pub(crate) fn submit(&self, job: impl FnOnce(&Q, &Liveness) + Send + 'static) {
        if let Some(jobs) = &self.jobs {
            let _ = jobs.send(Box::new(job));
        }
    }

    /// Stops accepting jobs and waits for the queued ones to finish.
    pub(crate) fn shutdown(&mut self) {
        self.jobs = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<Q> Drop for Worker<Q> {
    fn drop(&mut self) {
        // Detach: the worker drains what is left and aborts it.
        self.torn_down.store(true, Ordering::Release);
        self.jobs = None;
    }
}

/// Runs `op` on the worker, posting its outcome unless the bridge was torn
/// down before or during the call.
pub(crate) fn submit_op<Q, R>(
    worker: &Worker<Q>,
    dispatch: &DispatchHandle,
    handler: impl FnOnce(Result<R>) + Send + 'static,
    op: impl FnOnce(&Q) -> Result<R> + Send + 'static,
) where
    Q: Send + Sync + 'static,
    R: Send + 'static,
{
    let pending = Pending::new(dispatch, handler);
    worker.submit(move |queue, liveness| {
        if !liveness.is_alive() {
            return;
        }
        let result = op(queue);
        if liveness.is_alive() {
            pending.complete(result);
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::bridge::Dispatcher;

    #[test]
    fn dropped_pending_reports_aborted() {
        let mut dispatcher = Dispatcher::new();
        let outcome = Arc::new(Mutex::new(None));
        {
            let outcome = Arc::clone(&outcome);
            let pending = Pending::<u8>::new(&dispatcher.handle(), move |r| {
                *outcome.lock().unwrap() = Some(r.unwrap_err().is_aborted());
            });
            drop(pending);
        }
        assert_eq!(dispatcher.run(), 1);
        assert_eq!(*outcome.lock().unwrap(), Some(true));
    }

    #[test]
    fn completed_pending_posts_once() {
        let mut dispatcher = Dispatcher::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        {
            let calls = Arc::clone(&calls);
            Pending::<String>::new(&dispatcher.handle(), move |r| {
                calls.lock().unwrap().push(r.unwrap());
            })
            .complete(Ok("done".to_string()));
        }
        assert_eq!(dispatcher.run(), 1);
        assert_eq!(*calls.lock().unwrap(), ["done"]);
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let mut dispatcher = Dispatcher::new();
        let mut worker = Worker::spawn(Arc::new(Mutex::new(0u32)), "test-worker").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..5 {
            let seen = Arc::clone(&seen);
            submit_op(
                &worker,
                &dispatcher.handle(),
                move |r: Result<u32>| seen.lock().unwrap().push(r.unwrap()),
                |counter: &Mutex<u32>| {
                    let mut counter = counter.lock().unwrap();
                    *counter += 1;
                    Ok(*counter)
                },
            );
        }
        worker.shutdown();
        assert_eq!(dispatcher.run(), 5);
        assert_eq!(*seen.lock().unwrap(), [1, 2, 3, 4, 5]);
    }

    #[test]
    fn teardown_aborts_in_flight_and_queued_jobs() {
        let mut dispatcher = Dispatcher::new();
        let worker = Worker::spawn(Arc::new(()), "test-teardown").unwrap();
        let aborted = Arc::new(Mutex::new(0));

        for _ in 0..3 {
            let aborted = Arc::clone(&aborted);
            submit_op(
                &worker,
                &dispatcher.handle(),
                move |r: Result<()>| {
                    if r.unwrap_err().is_aborted() {
                        *aborted.lock().unwrap() += 1;
                    }
                },
                |_: &()| {
                    thread::sleep(Duration::from_millis(30));
                    Ok(())
                },
            );
        }
        drop(worker);
        assert_eq!(dispatcher.run(), 3);
        assert_eq!(*aborted.lock().unwrap(), 3);
    }
}
