//! POSIX shared memory with typestate-based cleanup.
//!
//! - [`Shm<T, Mode>`] maps one `T` into the address space.
//! - [`Creator`] unlinks the name on drop, [`Opener`] only unmaps.
//! - [`SharedMemorySafe`] marks types that may live in such a mapping.
//!
//! The region is initialized in place by the creator through a closure, so
//! types that must never be moved after initialization (pthread objects) can
//! live in it.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{ManuallyDrop, MaybeUninit, size_of};
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `shm_open`, `ftruncate`, `mmap`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The existing object has a different size than `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    /// The creator did not finish initializing the region in time.
    #[error("shared memory `{path}` was not initialized in time")]
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, source: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source,
        }
    }

    /// The errno behind a [`ShmError::Posix`] failure.
    #[must_use]
    pub const fn errno(&self) -> Option<io::Errno> {
        match self {
            Self::Posix { source, .. } => Some(*source),
            _ => None,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory name.
///
/// Must start with `/`, contain no other `/` and fit in `NAME_MAX`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates `path` as a shared memory name.
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] if the name is not portable.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let reason = if !path.starts_with('/') {
            Some("path must start with '/'")
        } else if path.len() == 1 {
            Some("path must name an object after '/'")
        } else if path[1..].contains('/') {
            Some("path must not contain additional '/' characters")
        } else if path.len() > POSIX_NAME_MAX {
            Some("path length must be <= 255 bytes")
        } else if path.contains('\0') {
            Some("path must not contain NUL")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ShmError::InvalidPath { path, reason }),
            None => Ok(Self(path)),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Removes the shared memory name. Returns `false` if it did not exist.
///
/// # Errors
///
/// Any `shm_unlink` failure other than `ENOENT`.
pub fn unlink(path: &ShmPath) -> Result<bool> {
    match shm::unlink(path.as_str()) {
        Ok(()) => Ok(true),
        Err(io::Errno::NOENT) => Ok(false),
        Err(err) => Err(ShmError::posix("shm_unlink", path, err)),
    }
}

/// Cleanup behavior of a [`Shm`] mapping.
pub trait ShmMode {
    /// Whether to unlink the name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker: created the object, unlinks the name on drop.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker: opened an existing object, leaves the name on drop.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in POSIX shared memory.
///
/// # Safety
///
/// Implementers must guarantee:
/// - `#[repr(C)]` layout, since every process maps the same bytes
/// - no pointers or references into process-local memory
/// - validity even if `Drop` never runs (processes may be killed)
/// - all concurrent access goes through atomics or process-shared primitives
pub unsafe trait SharedMemorySafe: Send + Sync {}

/// Smart pointer to a `T` living in POSIX shared memory.
///
/// `Mode` ([`Creator`] or [`Opener`]) decides whether dropping the mapping
/// also removes the name.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: T: SharedMemorySafe requires Send + Sync, and the pointer refers to
// a shared mapping rather than thread-local data.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}
// SAFETY: see above.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

fn map<T>(fd: &rustix::fd::OwnedFd, path: &ShmPath) -> Result<NonNull<T>> {
    // SAFETY: fresh shared mapping of an object that is at least size_of::<T>()
    // bytes long; mmap returns page-aligned memory, enough for any T here.
    let ptr = unsafe {
        mmap(
            null_mut(),
            size_of::<T>(),
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;
    NonNull::new(ptr.cast::<T>()).ok_or_else(|| ShmError::posix("mmap", path, io::Errno::FAULT))
}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates a new object sized for `T` and initializes it in place.
    ///
    /// `init` receives exclusive access to the uninitialized region and must
    /// fully initialize it. If `init` panics the object is removed before the
    /// panic propagates.
    ///
    /// # Errors
    ///
    /// `EEXIST` if the name is taken, or any `shm_open`/`ftruncate`/`mmap`
    /// failure.
    pub fn create(path: ShmPath, init: impl FnOnce(&mut MaybeUninit<T>)) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let mapped = ftruncate(&fd, size_of::<T>() as u64)
            .map_err(|err| ShmError::posix("ftruncate", &path, err))
            .and_then(|()| map::<T>(&fd, &path));
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(err);
            }
        };

        let shm = Self {
            ptr,
            path,
            _mode: PhantomData,
        };

        // SAFETY: the mapping is exclusively ours until the name is opened by
        // someone else, and openers wait for the type's own init marker.
        let init_result = catch_unwind(AssertUnwindSafe(|| unsafe {
            init(&mut *shm.ptr.as_ptr().cast::<MaybeUninit<T>>());
        }));
        match init_result {
            Ok(()) => Ok(shm),
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Opens an existing object and maps it.
    ///
    /// The caller is responsible for checking that the creator has finished
    /// initializing the region.
    ///
    /// # Errors
    ///
    /// `ENOENT` if the name does not exist, [`ShmError::SizeMismatch`] if the
    /// object is not exactly `size_of::<T>()` bytes (including a creator that
    /// has not sized it yet).
    pub fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", &path, err))?;
        if stat.st_size != size_of::<T>() as i64 {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        let ptr = map::<T>(&fd, &path)?;
        Ok(Self {
            ptr,
            path,
            _mode: PhantomData,
        })
    }

    /// Takes over responsibility for removing the name.
    ///
    /// The returned mapping unlinks on drop, so the name is removed exactly
    /// once no matter which handle created it.
    #[must_use]
    pub fn into_owner(self) -> Shm<T, Creator> {
        self.retype()
    }
}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Gives up responsibility for removing the name.
    #[must_use]
    pub fn into_guest(self) -> Shm<T, Opener> {
        self.retype()
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }

    fn retype<Next: ShmMode>(self) -> Shm<T, Next> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the path is moved out exactly once.
        let path = unsafe { std::ptr::read(&this.path) };
        Shm {
            ptr: this.ptr,
            path,
            _mode: PhantomData,
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from a successful mmap and are unmapped once.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<T>());
        }
        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: mapped for the lifetime of self; initialization is the
        // responsibility of create() and of the type's own open protocol.
        unsafe { self.ptr.as_ref() }
    }
}
