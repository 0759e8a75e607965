//! Error types shared by every transport.

use std::io;

use thiserror::Error;

use crate::codec::CodecError;
use crate::ipc::shmem::ShmError;

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Outcome of a queue operation that did not succeed.
///
/// `Aborted` and `TimedOut` are ordinary flow-control outcomes; only `Io`,
/// `Codec` and `Defunct` indicate that something actually went wrong.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The side of the queue this operation belongs to is disabled.
    #[error("operation aborted: queue side disabled")]
    Aborted,
    /// No progress was made before the timeout expired.
    #[error("operation timed out")]
    TimedOut,
    /// The underlying descriptor, socket or file failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The message could not be serialized or deserialized.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// The background worker feeding this queue has terminated.
    #[error("queue worker terminated")]
    Defunct,
}

impl QueueError {
    /// Returns `true` for [`QueueError::TimedOut`].
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Returns `true` for [`QueueError::Aborted`].
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Returns the OS error code for I/O failures that carry one.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

impl From<rustix::io::Errno> for QueueError {
    fn from(errno: rustix::io::Errno) -> Self {
        Self::Io(errno.into())
    }
}

/// Fatal failure while constructing a queue.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The directory backing a directory queue does not exist or is not a directory.
    #[error("`{0}` is not a directory")]
    NotADirectory(std::path::PathBuf),
    /// A host name did not resolve to any address.
    #[error("cannot resolve `{host}`: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    /// The listening socket could not be created, bound or put in listen mode.
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The named lock region could not be created or opened.
    #[error("named lock: {0}")]
    Shm(#[from] ShmError),
    /// A process-shared mutex or condition variable could not be initialized.
    #[error("{op} failed: {source}")]
    Sync {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    /// A background thread could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Any other I/O failure during construction.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_flow_control_outcomes() {
        assert!(QueueError::TimedOut.is_timeout());
        assert!(!QueueError::TimedOut.is_aborted());
        assert!(QueueError::Aborted.is_aborted());
        assert!(!QueueError::Defunct.is_timeout());
    }

    #[test]
    fn io_errors_keep_their_os_code() {
        let err = QueueError::from(io::Error::from_raw_os_error(libc::ECONNRESET));
        assert_eq!(err.raw_os_error(), Some(libc::ECONNRESET));
        assert_eq!(QueueError::Aborted.raw_os_error(), None);
    }

    #[test]
    fn errno_converts_to_io() {
        let err = QueueError::from(rustix::io::Errno::PIPE);
        assert_eq!(err.raw_os_error(), Some(libc::EPIPE));
    }
}
