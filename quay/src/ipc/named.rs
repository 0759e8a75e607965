//! Named mutex and condition variable shared between processes.
//!
//! The pair lives in a shared memory object `/quay-<name>` as process-shared
//! pthread primitives. On Linux the mutex is robust: if a holder dies, the
//! next locker recovers it instead of deadlocking.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::BuildError;
use crate::timeout::Timeout;
use crate::trace::{debug, warn};

use super::shmem::{self, Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmPath};

const INIT_MAGIC: u64 = 0x5155_4159_4C4F_434B; // "QUAYLOCK" in ASCII
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(target_os = "linux")]
const COND_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
const COND_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

#[repr(C)]
struct LockBlock {
    init: AtomicU64,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: repr(C), no pointers, and the pthread objects are initialized as
// PTHREAD_PROCESS_SHARED so every access is mediated by them.
unsafe impl Send for LockBlock {}
// SAFETY: see above.
unsafe impl Sync for LockBlock {}
// SAFETY: see above.
unsafe impl SharedMemorySafe for LockBlock {}

fn check(op: &'static str, rc: libc::c_int) -> Result<(), BuildError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(BuildError::Sync {
            op,
            source: io::Error::from_raw_os_error(rc),
        })
    }
}

impl LockBlock {
    /// Initializes the block in place; the marker is published last.
    fn init_shared(uninit: &mut MaybeUninit<Self>) -> Result<(), BuildError> {
        let ptr = uninit.as_mut_ptr();
        // SAFETY: exclusive access to freshly created shared memory; every
        // field is written before the marker is released.
        unsafe {
            addr_of_mut!((*ptr).init).write(AtomicU64::new(0));
            init_mutex(UnsafeCell::raw_get(addr_of_mut!((*ptr).mutex)))?;
            init_cond(UnsafeCell::raw_get(addr_of_mut!((*ptr).cond)))?;
            (*ptr).init.store(INIT_MAGIC, Ordering::Release);
        }
        Ok(())
    }

    fn wait_for_init(&self) -> bool {
        let deadline = Timeout::Duration(INIT_TIMEOUT).start();
        loop {
            if self.init.load(Ordering::Acquire) == INIT_MAGIC {
                return true;
            }
            if deadline.expired() {
                return false;
            }
            thread::yield_now();
        }
    }
}

/// # Safety
///
/// `mutex` must point to writable memory that outlives every user.
unsafe fn init_mutex(mutex: *mut libc::pthread_mutex_t) -> Result<(), BuildError> {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    // SAFETY: attr is initialized before use and destroyed afterwards.
    unsafe {
        check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let attr = attr.as_mut_ptr();
        let result = check(
            "pthread_mutexattr_setpshared",
            libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED),
        )
        .and_then(|()| robust(attr))
        .and_then(|()| check("pthread_mutex_init", libc::pthread_mutex_init(mutex, attr)));
        libc::pthread_mutexattr_destroy(attr);
        result
    }
}

#[cfg(target_os = "linux")]
unsafe fn robust(attr: *mut libc::pthread_mutexattr_t) -> Result<(), BuildError> {
    // SAFETY: attr is an initialized attribute object.
    check("pthread_mutexattr_setrobust", unsafe {
        libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST)
    })
}

#[cfg(not(target_os = "linux"))]
unsafe fn robust(_attr: *mut libc::pthread_mutexattr_t) -> Result<(), BuildError> {
    Ok(())
}

/// # Safety
///
/// `cond` must point to writable memory that outlives every user.
unsafe fn init_cond(cond: *mut libc::pthread_cond_t) -> Result<(), BuildError> {
    let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
    // SAFETY: attr is initialized before use and destroyed afterwards.
    unsafe {
        check("pthread_condattr_init", libc::pthread_condattr_init(attr.as_mut_ptr()))?;
        let attr = attr.as_mut_ptr();
        let result = check(
            "pthread_condattr_setpshared",
            libc::pthread_condattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED),
        )
        .and_then(|()| cond_clock(attr))
        .and_then(|()| check("pthread_cond_init", libc::pthread_cond_init(cond, attr)));
        libc::pthread_condattr_destroy(attr);
        result
    }
}

#[cfg(target_os = "linux")]
unsafe fn cond_clock(attr: *mut libc::pthread_condattr_t) -> Result<(), BuildError> {
    // SAFETY: attr is an initialized attribute object.
    check("pthread_condattr_setclock", unsafe {
        libc::pthread_condattr_setclock(attr, COND_CLOCK)
    })
}

#[cfg(not(target_os = "linux"))]
unsafe fn cond_clock(_attr: *mut libc::pthread_condattr_t) -> Result<(), BuildError> {
    Ok(())
}

/// Absolute `COND_CLOCK` time `after` from now.
fn deadline_after(after: Duration) -> libc::timespec {
    let mut now = MaybeUninit::<libc::timespec>::zeroed();
    // SAFETY: clock_gettime writes a timespec; on failure it stays zeroed and
    // the wait returns immediately, which callers treat as a timeout.
    let now = unsafe {
        libc::clock_gettime(COND_CLOCK, now.as_mut_ptr());
        now.assume_init()
    };
    let mut sec = i64::from(now.tv_sec).saturating_add(i64::try_from(after.as_secs()).unwrap_or(i64::MAX));
    let mut nsec = i64::from(now.tv_nsec) + i64::from(after.subsec_nanos());
    if nsec >= 1_000_000_000 {
        nsec -= 1_000_000_000;
        sec = sec.saturating_add(1);
    }
    libc::timespec {
        tv_sec: libc::time_t::try_from(sec).unwrap_or(libc::time_t::MAX),
        tv_nsec: nsec as _,
    }
}

enum Mapping {
    Owner(Shm<LockBlock, Creator>),
    Guest(Shm<LockBlock, Opener>),
}

/// Handle to a named cross-process mutex/condition pair.
///
/// Handles opened with `owner = true` remove the name when dropped. The
/// primitives themselves are never destroyed, since other processes may
/// still hold mappings.
pub struct NamedLock {
    map: Mapping,
}

impl NamedLock {
    /// Shared memory name used for the lock called `name`.
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] if `name` contains `/` or is too long.
    pub fn path_for(name: &str) -> Result<ShmPath, ShmError> {
        ShmPath::new(format!("/quay-{name}"))
    }

    /// Opens the lock called `name`, creating it if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Invalid names, shared memory failures, pthread initialization
    /// failures, or a creator that never finished initializing.
    pub fn open_or_create(name: &str, owner: bool) -> Result<Self, BuildError> {
        let path = Self::path_for(name)?;
        let deadline = Timeout::Duration(INIT_TIMEOUT).start();
        loop {
            let mut init = Ok(());
            let created = Shm::<LockBlock, Creator>::create(path.clone(), |uninit| {
                init = LockBlock::init_shared(uninit);
            });
            match created {
                Ok(shm) => {
                    init?;
                    debug!(path = %path, owner, "created named lock");
                    let map = if owner {
                        Mapping::Owner(shm)
                    } else {
                        Mapping::Guest(shm.into_guest())
                    };
                    return Ok(Self { map });
                }
                Err(err) if err.errno() != Some(rustix::io::Errno::EXIST) => {
                    return Err(err.into());
                }
                Err(_) => {}
            }

            match Shm::<LockBlock, Opener>::open(path.clone()) {
                Ok(shm) => {
                    if !shm.wait_for_init() {
                        return Err(ShmError::InitTimeout {
                            path: path.to_string(),
                        }
                        .into());
                    }
                    debug!(path = %path, owner, "opened named lock");
                    let map = if owner {
                        Mapping::Owner(shm.into_owner())
                    } else {
                        Mapping::Guest(shm)
                    };
                    return Ok(Self { map });
                }
                // Raced with a creator that has not sized the object yet, or
                // with one that removed it again.
                Err(ShmError::SizeMismatch { actual: 0, .. }) if !deadline.expired() => {}
                Err(err) if err.errno() == Some(rustix::io::Errno::NOENT) && !deadline.expired() => {}
                Err(ShmError::SizeMismatch { .. }) if deadline.expired() => {
                    return Err(ShmError::InitTimeout {
                        path: path.to_string(),
                    }
                    .into());
                }
                Err(err) => return Err(err.into()),
            }
            thread::yield_now();
        }
    }

    /// Removes the name of the lock called `name`.
    ///
    /// Processes that already mapped it keep working; later opens create a
    /// fresh lock. Returns `false` if no such lock existed.
    ///
    /// # Errors
    ///
    /// Invalid names or `shm_unlink` failures.
    pub fn remove(name: &str) -> Result<bool, ShmError> {
        shmem::unlink(&Self::path_for(name)?)
    }

    /// Whether dropping this handle removes the name.
    #[must_use]
    pub const fn is_owner(&self) -> bool {
        matches!(self.map, Mapping::Owner(_))
    }

    #[must_use]
    pub fn path(&self) -> &ShmPath {
        match &self.map {
            Mapping::Owner(shm) => shm.path(),
            Mapping::Guest(shm) => shm.path(),
        }
    }

    fn block(&self) -> &LockBlock {
        match &self.map {
            Mapping::Owner(shm) => shm,
            Mapping::Guest(shm) => shm,
        }
    }

    fn mutex(&self) -> *mut libc::pthread_mutex_t {
        self.block().mutex.get()
    }

    fn cond(&self) -> *mut libc::pthread_cond_t {
        self.block().cond.get()
    }

    /// Locks the mutex, blocking until it is available.
    ///
    /// # Errors
    ///
    /// Errors reported by `pthread_mutex_lock`.
    pub fn lock(&self) -> io::Result<NamedGuard<'_>> {
        // SAFETY: the mutex was initialized before the marker was published.
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex()) };
        self.acquired(rc)?;
        Ok(NamedGuard { lock: self })
    }

    /// Wakes every process waiting on the condition.
    pub fn notify_all(&self) {
        // SAFETY: initialized condition variable.
        unsafe {
            libc::pthread_cond_broadcast(self.cond());
        }
    }

    fn acquired(&self, rc: libc::c_int) -> io::Result<()> {
        match rc {
            0 => Ok(()),
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                warn!(path = %self.path(), "previous holder died, recovering named lock");
                // SAFETY: we hold the mutex in the owner-dead state.
                unsafe {
                    libc::pthread_mutex_consistent(self.mutex());
                }
                Ok(())
            }
            rc => Err(io::Error::from_raw_os_error(rc)),
        }
    }
}

/// Proof that the [`NamedLock`] mutex is held; unlocks on drop.
pub struct NamedGuard<'a> {
    lock: &'a NamedLock,
}

impl NamedGuard<'_> {
    /// Atomically releases the mutex and waits for a notification.
    ///
    /// # Errors
    ///
    /// Errors reported by `pthread_cond_wait`.
    pub fn wait(&mut self) -> io::Result<()> {
        // SAFETY: the mutex is held by this guard.
        let rc = unsafe { libc::pthread_cond_wait(self.lock.cond(), self.lock.mutex()) };
        self.lock.acquired(rc)
    }

    /// Like [`NamedGuard::wait`] but gives up after `timeout`.
    ///
    /// Returns `false` if the wait timed out. Spurious wakeups return `true`.
    ///
    /// # Errors
    ///
    /// Errors reported by `pthread_cond_timedwait`.
    pub fn wait_for(&mut self, timeout: Duration) -> io::Result<bool> {
        let at = deadline_after(timeout);
        // SAFETY: the mutex is held by this guard.
        let rc =
            unsafe { libc::pthread_cond_timedwait(self.lock.cond(), self.lock.mutex(), &at) };
        if rc == libc::ETIMEDOUT {
            return Ok(false);
        }
        self.lock.acquired(rc).map(|()| true)
    }

    /// Wakes every process waiting on the condition.
    pub fn notify_all(&self) {
        self.lock.notify_all();
    }
}

impl Drop for NamedGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the mutex is held by this guard.
        unsafe {
            libc::pthread_mutex_unlock(self.lock.mutex());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    use super::*;

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        format!("test-{tag}-{}-{n}", std::process::id())
    }

    fn open(name: &str, owner: bool) -> Option<NamedLock> {
        match NamedLock::open_or_create(name, owner) {
            Ok(lock) => Some(lock),
            Err(BuildError::Shm(err)) if err.errno() == Some(rustix::io::Errno::ACCESS) => {
                eprintln!("skipping: {err}");
                None
            }
            Err(err) => panic!("open_or_create failed: {err}"),
        }
    }

    #[test]
    fn second_handle_opens_existing_lock() {
        let name = unique_name("reopen");
        let Some(first) = open(&name, true) else {
            return;
        };
        let second = open(&name, false).unwrap();
        assert!(first.is_owner());
        assert!(!second.is_owner());
        assert_eq!(first.path(), second.path());

        drop(second.lock().unwrap());
        drop(first.lock().unwrap());

        drop(second);
        drop(first);
        assert!(!NamedLock::remove(&name).unwrap());
    }

    #[test]
    fn guest_handles_leave_the_name() {
        let name = unique_name("guest");
        let Some(lock) = open(&name, false) else {
            return;
        };
        drop(lock);
        assert!(NamedLock::remove(&name).unwrap());
    }

    #[test]
    fn timed_wait_expires() {
        let name = unique_name("timed");
        let Some(lock) = open(&name, true) else {
            return;
        };
        let mut guard = lock.lock().unwrap();
        let start = Instant::now();
        // Spurious wakeups report `true`; keep waiting until one times out.
        while guard.wait_for(Duration::from_millis(30)).unwrap() {
            assert!(start.elapsed() < Duration::from_secs(2), "wait never timed out");
        }
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn notify_wakes_waiter_on_other_mapping() {
        let name = unique_name("notify");
        let Some(lock) = open(&name, true) else {
            return;
        };
        let other = open(&name, false).unwrap();
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let mut guard = other.lock().unwrap();
                while !flag.load(Ordering::SeqCst) {
                    guard.wait_for(Duration::from_secs(5)).unwrap();
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let guard = lock.lock().unwrap();
            flag.store(true, Ordering::SeqCst);
            guard.notify_all();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(matches!(
            NamedLock::open_or_create("a/b", false),
            Err(BuildError::Shm(ShmError::InvalidPath { .. }))
        ));
    }
}
