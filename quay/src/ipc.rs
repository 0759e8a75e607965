//! Cross-process primitives backing the directory queue.

pub mod named;
pub mod shmem;

pub use named::{NamedGuard, NamedLock};
pub use shmem::{ShmError, ShmPath};
