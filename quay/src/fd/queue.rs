//! Queues over one byte-stream descriptor, one direction each.

use std::marker::PhantomData;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::poll::{self, Gate};
use super::stream::{self, FrameReader};
use crate::codec::{Codec, DEFAULT_SEPARATOR};
use crate::error::{BuildError, Result};
use crate::queue::{Dequeue, Enqueue};
use crate::timeout::Timeout;

/// Dequeue-only queue reading frames from a descriptor.
///
/// Takes ownership of the descriptor (switching it to non-blocking mode) and
/// closes it on drop.
pub struct FdDequeue<T, C> {
    fd: OwnedFd,
    codec: C,
    reader: Mutex<FrameReader>,
    gate: Gate,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: Codec<T>> FdDequeue<T, C> {
    /// Reads frames delimited by [`DEFAULT_SEPARATOR`].
    ///
    /// # Errors
    ///
    /// Failure to configure the descriptor or create the wake pipe.
    pub fn new(fd: OwnedFd, codec: C) -> std::result::Result<Self, BuildError> {
        Self::with_separator(fd, codec, DEFAULT_SEPARATOR)
    }

    /// # Errors
    ///
    /// Failure to configure the descriptor or create the wake pipe.
    pub fn with_separator(
        fd: OwnedFd,
        codec: C,
        separator: u8,
    ) -> std::result::Result<Self, BuildError> {
        poll::set_nonblocking(fd.as_fd())?;
        Ok(Self {
            fd,
            codec,
            reader: Mutex::new(FrameReader::new(separator)),
            gate: Gate::new()?,
            _marker: PhantomData,
        })
    }
}

impl<T, C> FdDequeue<T, C> {
    fn reader(&self) -> MutexGuard<'_, FrameReader> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, C> AsFd for FdDequeue<T, C> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl<T, C: Codec<T>> Dequeue<T> for FdDequeue<T, C> {
    fn dequeue_with(&self, timeout: Timeout) -> Result<T> {
        let deadline = timeout.start();
        let frame = self
            .reader()
            .read_frame(self.fd.as_fd(), &self.gate, &deadline)?;
        Ok(self.codec.decode(&frame)?)
    }

    fn wait_dequeueable_with(&self, timeout: Timeout) -> Result<()> {
        let deadline = timeout.start();
        self.reader()
            .wait_readable(self.fd.as_fd(), &self.gate, &deadline)
    }

    fn disable_dequeue(&self, disable: bool) {
        self.gate.set_disabled(disable);
    }
}

/// Enqueue-only queue writing frames to a descriptor.
///
/// Takes ownership of the descriptor (switching it to non-blocking mode) and
/// closes it on drop.
pub struct FdEnqueue<T, C> {
    fd: OwnedFd,
    codec: C,
    separator: u8,
    /// Held for a whole frame so concurrent writers never interleave bytes.
    writing: Mutex<()>,
    gate: Gate,
    _marker: PhantomData<fn(T)>,
}

impl<T, C: Codec<T>> FdEnqueue<T, C> {
    /// Writes frames delimited by [`DEFAULT_SEPARATOR`].
    ///
    /// # Errors
    ///
    /// Failure to configure the descriptor or create the wake pipe.
    pub fn new(fd: OwnedFd, codec: C) -> std::result::Result<Self, BuildError> {
        Self::with_separator(fd, codec, DEFAULT_SEPARATOR)
    }

    /// # Errors
    ///
    /// Failure to configure the descriptor or create the wake pipe.
    pub fn with_separator(
        fd: OwnedFd,
        codec: C,
        separator: u8,
    ) -> std::result::Result<Self, BuildError> {
        poll::set_nonblocking(fd.as_fd())?;
        Ok(Self {
            fd,
            codec,
            separator,
            writing: Mutex::new(()),
            gate: Gate::new()?,
            _marker: PhantomData,
        })
    }
}

impl<T, C> AsFd for FdEnqueue<T, C> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl<T, C: Codec<T>> Enqueue<T> for FdEnqueue<T, C> {
    fn enqueue_with(&self, value: T, timeout: Timeout) -> Result<()> {
        let mut frame = Vec::new();
        self.codec.encode(&value, &mut frame)?;
        frame.push(self.separator);

        let deadline = timeout.start();
        let _writing = self.writing.lock().unwrap_or_else(PoisonError::into_inner);
        stream::write_frame(self.fd.as_fd(), &frame, &self.gate, &deadline)
    }

    fn wait_enqueueable_with(&self, timeout: Timeout) -> Result<()> {
        let deadline = timeout.start();
        let _writing = self.writing.lock().unwrap_or_else(PoisonError::into_inner);
        stream::wait_writable(self.fd.as_fd(), &self.gate, &deadline)
    }

    fn disable_enqueue(&self, disable: bool) {
        self.gate.set_disabled(disable);
    }
}
