//! Readiness waits on a single descriptor, interruptible by a self-pipe.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustix::event::{self, PollFd, PollFlags, Timespec};
use rustix::io::Errno;

use crate::timeout::Deadline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ready {
    /// The descriptor is ready (or has an error/hangup pending).
    Io,
    /// The waker was raised.
    Woken,
    TimedOut,
}

/// Blocks until `fd` is ready for `interest`, `waker` is readable, or
/// `deadline` passes.
pub(crate) fn wait(
    fd: BorrowedFd<'_>,
    interest: Interest,
    waker: Option<BorrowedFd<'_>>,
    deadline: &Deadline,
) -> io::Result<Ready> {
    let events = match interest {
        Interest::Read => PollFlags::IN,
        Interest::Write => PollFlags::OUT,
    };
    let waker_fd = waker.unwrap_or(fd);
    let watched = if waker.is_some() { 2 } else { 1 };
    loop {
        let mut fds = [PollFd::new(&fd, events), PollFd::new(&waker_fd, PollFlags::IN)];
        let timeout = deadline.remaining().map(timespec);
        match event::poll(&mut fds[..watched], timeout.as_ref()) {
            Ok(0) => {
                if deadline.expired() {
                    return Ok(Ready::TimedOut);
                }
                continue;
            }
            Ok(_) => {}
            Err(Errno::INTR) => continue,
            Err(err) => return Err(err.into()),
        }
        if watched == 2 && !fds[1].revents().is_empty() {
            return Ok(Ready::Woken);
        }
        let revents = fds[0].revents();
        if revents.contains(PollFlags::NVAL) {
            return Err(Errno::BADF.into());
        }
        if revents.intersects(events | PollFlags::ERR | PollFlags::HUP) {
            return Ok(Ready::Io);
        }
    }
}

fn timespec(left: Duration) -> Timespec {
    Timespec {
        tv_sec: i64::try_from(left.as_secs()).unwrap_or(i64::MAX),
        tv_nsec: left.subsec_nanos() as _,
    }
}

/// Switches `fd` to non-blocking mode.
pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    rustix::io::ioctl_fionbio(fd, true)?;
    Ok(())
}

/// Self-pipe that stays readable while raised.
struct Waker {
    read: OwnedFd,
    write: OwnedFd,
}

impl Waker {
    fn new() -> io::Result<Self> {
        let (read, write) = rustix::pipe::pipe()?;
        set_nonblocking(read.as_fd())?;
        set_nonblocking(write.as_fd())?;
        Ok(Self { read, write })
    }

    fn raise(&self) {
        let _ = rustix::io::write(&self.write, &[1]);
    }

    fn clear(&self) {
        let mut scratch = [0u8; 64];
        while matches!(rustix::io::read(&self.read, &mut scratch), Ok(n) if n > 0) {}
    }
}

/// Enable flag of one queue side plus the waker that interrupts its waits.
///
/// While closed, the waker is readable, so any [`wait`] that includes
/// [`Gate::waker`] returns [`Ready::Woken`] immediately.
pub(crate) struct Gate {
    open: AtomicBool,
    waker: Waker,
    /// Serializes toggles so the pipe level always matches `open`.
    raised: Mutex<bool>,
}

impl Gate {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            open: AtomicBool::new(true),
            waker: Waker::new()?,
            raised: Mutex::new(false),
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn set_disabled(&self, disable: bool) {
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        self.open.store(!disable, Ordering::Release);
        if disable && !*raised {
            self.waker.raise();
            *raised = true;
        } else if !disable && *raised {
            self.waker.clear();
            *raised = false;
        }
    }

    pub(crate) fn waker(&self) -> BorrowedFd<'_> {
        self.waker.read.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::timeout::Timeout;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let (r, w) = rustix::pipe::pipe().unwrap();
        set_nonblocking(r.as_fd()).unwrap();
        set_nonblocking(w.as_fd()).unwrap();
        (r, w)
    }

    #[test]
    fn times_out_without_data() {
        let (r, _w) = pipe();
        let deadline = Timeout::from(Duration::from_millis(20)).start();
        let start = Instant::now();
        assert_eq!(wait(r.as_fd(), Interest::Read, None, &deadline).unwrap(), Ready::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn reports_readable_and_writable() {
        let (r, w) = pipe();
        assert_eq!(
            wait(w.as_fd(), Interest::Write, None, &Deadline::NEVER).unwrap(),
            Ready::Io
        );
        rustix::io::write(&w, b"x").unwrap();
        assert_eq!(
            wait(r.as_fd(), Interest::Read, None, &Deadline::NEVER).unwrap(),
            Ready::Io
        );
    }

    #[test]
    fn closed_gate_wakes_waiters_until_reopened() {
        let (r, _w) = pipe();
        let gate = Gate::new().unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| wait(r.as_fd(), Interest::Read, Some(gate.waker()), &Deadline::NEVER));
            thread::sleep(Duration::from_millis(20));
            gate.set_disabled(true);
            assert_eq!(waiter.join().unwrap().unwrap(), Ready::Woken);
        });
        assert!(!gate.is_open());

        // Level-triggered: stays readable, and a second disable is a no-op.
        gate.set_disabled(true);
        assert_eq!(
            wait(r.as_fd(), Interest::Read, Some(gate.waker()), &Deadline::NEVER).unwrap(),
            Ready::Woken
        );

        gate.set_disabled(false);
        assert!(gate.is_open());
        let deadline = Timeout::from(Duration::from_millis(10)).start();
        assert_eq!(
            wait(r.as_fd(), Interest::Read, Some(gate.waker()), &deadline).unwrap(),
            Ready::TimedOut
        );
    }
}
