//! Caller-owned completion queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use crate::timeout::Timeout;

type Completion = Box<dyn FnOnce() + Send>;

/// Runs completion handlers on the thread that drives it.
///
/// Bridges post completions through a [`DispatchHandle`]. The dispatcher
/// counts outstanding work (submitted operations whose handler has not run
/// yet), so [`Dispatcher::run`] returns once everything submitted so far has
/// completed.
pub struct Dispatcher {
    rx: Receiver<Completion>,
    handle: DispatchHandle,
}

/// Cloneable, `Send` handle used to post completions to a [`Dispatcher`].
#[derive(Clone)]
pub struct DispatchHandle {
    tx: Sender<Completion>,
    outstanding: Arc<AtomicUsize>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx,
            handle: DispatchHandle {
                tx,
                outstanding: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    #[must_use]
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Outstanding work items whose handlers have not run yet.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.handle.outstanding.load(Ordering::Acquire)
    }

    fn invoke(&self, completion: Completion) {
        completion();
        self.handle.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Runs handlers until no work is outstanding. Returns how many ran.
    pub fn run(&mut self) -> usize {
        let mut ran = 0;
        while self.outstanding() > 0 {
            // The dispatcher keeps its own sender, so recv never disconnects.
            let Ok(completion) = self.rx.recv() else {
                break;
            };
            self.invoke(completion);
            ran += 1;
        }
        ran
    }

    /// Blocks for and runs a single handler.
    ///
    /// Returns `false` without blocking if no work is outstanding.
    pub fn run_one(&mut self) -> bool {
        if self.outstanding() == 0 {
            return false;
        }
        match self.rx.recv() {
            Ok(completion) => {
                self.invoke(completion);
                true
            }
            Err(_) => false,
        }
    }

    /// Runs every handler that is ready, without blocking.
    pub fn poll(&mut self) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(completion) => {
                    self.invoke(completion);
                    ran += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Like [`Dispatcher::run`] but returns after `limit` at the latest.
    pub fn run_for(&mut self, limit: Duration) -> usize {
        let deadline = Timeout::Duration(limit).start();
        let mut ran = 0;
        while self.outstanding() > 0 {
            let Some(left) = deadline.remaining() else {
                break;
            };
            match self.rx.recv_timeout(left) {
                Ok(completion) => {
                    self.invoke(completion);
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }
        ran
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchHandle {
    /// Posts `f` to run on the dispatcher thread.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.work().post(f);
    }

    /// Registers one unit of outstanding work, completed by [`Work::post`].
    pub(crate) fn work(&self) -> Work {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Work {
            handle: Some(self.clone()),
        }
    }
}

/// One unit of outstanding work. Posting its completion hands the count to
/// the dispatcher; dropping it unposted releases the count.
pub(crate) struct Work {
    handle: Option<DispatchHandle>,
}

impl Work {
    pub(crate) fn post(mut self, f: impl FnOnce() + Send + 'static) {
        if let Some(handle) = self.handle.take() {
            if let Err(mpsc::SendError(_)) = handle.tx.send(Box::new(f)) {
                handle.outstanding.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
