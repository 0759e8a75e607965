//! Durable queue backed by a directory, one file per message.
//!
//! Any number of processes may share a queue by using the same directory and
//! the same queue name. Access is serialized by a [`NamedLock`] derived from
//! the name, and its condition variable carries "something changed" signals
//! between processes.
//!
//! # On-disk format
//!
//! Each message is a regular file whose content is exactly the codec output.
//! File names are random identifiers with no ordering meaning; messages are
//! consumed in modification-time order, ties broken by name. Hidden files
//! (leading `.`) are ignored: writers use them as temporaries, and files that
//! fail to decode are renamed to `.corrupt-<name>`.
//!
//! # Delivery
//!
//! A file is deleted only after it decoded successfully, and before the value
//! is returned. A consumer that crashes between the two loses that message;
//! delivery is best-effort, not exactly-once. Modification times from
//! different writers may tie or be coarse, so cross-process order is only as
//! good as the filesystem clock.

mod cache;

use std::fs;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::codec::Codec;
use crate::error::{BuildError, QueueError, Result};
use crate::ipc::shmem::ShmError;
use crate::ipc::{NamedGuard, NamedLock};
use crate::queue::{Dequeue, Enqueue};
use crate::timeout::{Deadline, Timeout};
use crate::trace::{debug, trace, warn};

use cache::FileCache;

/// Configuration for a [`DirQueue`].
#[derive(Debug, Clone)]
pub struct DirQueueConfig {
    /// Queue name; processes sharing a queue must agree on it. Derives the
    /// lock name, so it must not contain `/`.
    pub name: String,
    /// Directory holding the message files. Must already exist.
    pub dir: PathBuf,
    /// Maximum number of message files (`0` = unbounded). Adjustable later
    /// through [`DirQueue::set_capacity`].
    pub capacity: usize,
    /// Remove the named lock when this instance is dropped.
    pub remove_locks: bool,
    /// How often blocked callers re-list the directory even without a signal.
    pub rescan_interval: Duration,
}

impl Default for DirQueueConfig {
    fn default() -> Self {
        Self {
            name: "quay".to_string(),
            dir: std::env::temp_dir().join("quay"),
            capacity: 0,
            remove_locks: false,
            rescan_interval: Duration::from_millis(250),
        }
    }
}

/// Cross-process FIFO over the files of one directory.
pub struct DirQueue<T, C> {
    config: DirQueueConfig,
    codec: C,
    lock: NamedLock,
    /// Only touched while `lock` is held.
    cache: Mutex<FileCache>,
    capacity: AtomicUsize,
    enq_enabled: AtomicBool,
    deq_enabled: AtomicBool,
    _marker: PhantomData<fn() -> T>,
}

enum Found<T> {
    Value(T),
    /// The entry was taken by someone else between listing and reading.
    Raced,
}

impl<T, C: Codec<T>> DirQueue<T, C> {
    /// Opens the queue described by `config`.
    ///
    /// # Errors
    ///
    /// [`BuildError::NotADirectory`] if `config.dir` is missing,
    /// [`BuildError::InvalidConfig`] for a zero rescan interval, or any failure
    /// creating the named lock.
    pub fn new(config: DirQueueConfig, codec: C) -> std::result::Result<Self, BuildError> {
        if !config.dir.is_dir() {
            return Err(BuildError::NotADirectory(config.dir));
        }
        if config.rescan_interval.is_zero() {
            return Err(BuildError::InvalidConfig("rescan_interval must be non-zero"));
        }
        let lock = NamedLock::open_or_create(&config.name, config.remove_locks)?;
        debug!(
            name = %config.name,
            dir = %config.dir.display(),
            capacity = config.capacity,
            "opened directory queue"
        );
        let capacity = AtomicUsize::new(config.capacity);
        Ok(Self {
            config,
            codec,
            lock,
            cache: Mutex::new(FileCache::default()),
            capacity,
            enq_enabled: AtomicBool::new(true),
            deq_enabled: AtomicBool::new(true),
            _marker: PhantomData,
        })
    }
}

impl<T, C> DirQueue<T, C> {
    /// Removes the named lock of the queue called `name`.
    ///
    /// Returns `false` if it did not exist. Only safe once no process uses
    /// the queue, otherwise later openers get a different lock.
    ///
    /// # Errors
    ///
    /// Invalid names or `shm_unlink` failures.
    pub fn remove_locks(name: &str) -> std::result::Result<bool, ShmError> {
        NamedLock::remove(name)
    }

    /// Queue name the named lock is derived from.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Directory holding the message files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Maximum number of messages, `0` if unbounded.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Changes the capacity bound of this instance (`0` = unbounded) and
    /// wakes every waiter on the named condition.
    ///
    /// The bound is per instance: other processes sharing the directory keep
    /// their own.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
        self.wake_all();
    }

    /// Number of messages currently in the directory.
    ///
    /// # Errors
    ///
    /// Failure to list the directory.
    pub fn len(&self) -> Result<usize> {
        Ok(cache::count(&self.config.dir)?)
    }

    /// # Errors
    ///
    /// Failure to list the directory.
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    /// Whether an enqueue would currently block.
    ///
    /// # Errors
    ///
    /// Failure to list the directory.
    pub fn is_full(&self) -> Result<bool> {
        let capacity = self.capacity();
        if capacity == 0 {
            return Ok(false);
        }
        self.len().map(|n| n >= capacity)
    }

    fn has_room(&self) -> Result<bool> {
        self.is_full().map(|full| !full)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, FileCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps on the named condition for at most one rescan interval.
    fn park(&self, guard: &mut NamedGuard<'_>, deadline: &Deadline) -> Result<()> {
        if deadline.expired() {
            return Err(QueueError::TimedOut);
        }
        guard.wait_for(deadline.slice(self.config.rescan_interval))?;
        Ok(())
    }

    /// Wakes waiters after a disable or capacity change so they re-check.
    fn wake_all(&self) {
        // Taking the lock orders the flag store before any waiter's recheck.
        let _guard = self.lock.lock();
        self.lock.notify_all();
    }

    /// Oldest message path, re-listing the directory when the cache runs dry.
    fn oldest(&self) -> Result<Option<PathBuf>> {
        let mut cache = self.cache();
        if let Some(path) = cache.front() {
            return Ok(Some(path.to_path_buf()));
        }
        let listed = cache.refill(&self.config.dir)?;
        if listed > 0 {
            trace!(name = %self.config.name, listed, "refilled directory cache");
        }
        Ok(cache.front().map(Path::to_path_buf))
    }

    fn write_message(&self, bytes: &[u8]) -> io::Result<PathBuf> {
        let id = format!("{:032x}", rand::random::<u128>());
        let temp = self.config.dir.join(format!(".tmp-{id}"));
        let path = self.config.dir.join(&id);
        let written = fs::File::create_new(&temp).and_then(|mut file| file.write_all(bytes));
        if let Err(err) = written.and_then(|()| fs::rename(&temp, &path)) {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }
        Ok(path)
    }

    /// Moves an undecodable file out of the way so it is never re-offered.
    fn quarantine(&self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        let mut hidden = std::ffi::OsString::from(".corrupt-");
        hidden.push(name);
        let target = path.with_file_name(hidden);
        warn!(path = %path.display(), target = %target.display(), "quarantining undecodable message");
        if fs::rename(path, &target).is_err() {
            let _ = fs::remove_file(path);
        }
    }
}

impl<T, C: Codec<T>> DirQueue<T, C> {
    fn take(&self, path: &Path) -> Result<Found<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Found::Raced),
            Err(err) => return Err(err.into()),
        };
        let value = match self.codec.decode(&bytes) {
            Ok(value) => value,
            Err(err) => {
                self.cache().remove(path);
                self.quarantine(path);
                return Err(err.into());
            }
        };
        self.cache().remove(path);
        match fs::remove_file(path) {
            Ok(()) => Ok(Found::Value(value)),
            // Consumed by a process that does not take the named lock.
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Found::Raced),
            Err(err) => Err(err.into()),
        }
    }
}

impl<T, C: Codec<T>> Enqueue<T> for DirQueue<T, C> {
    fn enqueue_with(&self, value: T, timeout: Timeout) -> Result<()> {
        if !self.enq_enabled.load(Ordering::Acquire) {
            return Err(QueueError::Aborted);
        }
        let mut bytes = Vec::new();
        self.codec.encode(&value, &mut bytes)?;

        let deadline = timeout.start();
        let mut guard = self.lock.lock()?;
        loop {
            if !self.enq_enabled.load(Ordering::Acquire) {
                return Err(QueueError::Aborted);
            }
            if self.has_room()? {
                break;
            }
            self.park(&mut guard, &deadline)?;
        }
        let _path = self.write_message(&bytes)?;
        trace!(path = %_path.display(), "enqueued message file");
        guard.notify_all();
        Ok(())
    }

    fn wait_enqueueable_with(&self, timeout: Timeout) -> Result<()> {
        let deadline = timeout.start();
        let mut guard = self.lock.lock()?;
        loop {
            if !self.enq_enabled.load(Ordering::Acquire) {
                return Err(QueueError::Aborted);
            }
            if self.has_room()? {
                return Ok(());
            }
            self.park(&mut guard, &deadline)?;
        }
    }

    fn disable_enqueue(&self, disable: bool) {
        self.enq_enabled.store(!disable, Ordering::Release);
        self.wake_all();
    }
}

impl<T, C: Codec<T>> Dequeue<T> for DirQueue<T, C> {
    fn dequeue_with(&self, timeout: Timeout) -> Result<T> {
        let deadline = timeout.start();
        let mut guard = self.lock.lock()?;
        loop {
            if !self.deq_enabled.load(Ordering::Acquire) {
                return Err(QueueError::Aborted);
            }
            match self.oldest()? {
                Some(path) => {
                    if let Found::Value(value) = self.take(&path)? {
                        // Room for blocked producers.
                        guard.notify_all();
                        return Ok(value);
                    }
                }
                None => self.park(&mut guard, &deadline)?,
            }
        }
    }

    fn wait_dequeueable_with(&self, timeout: Timeout) -> Result<()> {
        let deadline = timeout.start();
        let mut guard = self.lock.lock()?;
        loop {
            if !self.deq_enabled.load(Ordering::Acquire) {
                return Err(QueueError::Aborted);
            }
            if self.oldest()?.is_some() {
                return Ok(());
            }
            self.park(&mut guard, &deadline)?;
        }
    }

    fn disable_dequeue(&self, disable: bool) {
        self.deq_enabled.store(!disable, Ordering::Release);
        if disable {
            self.cache().clear();
        }
        self.wake_all();
    }
}
