//! Separator-delimited frames over a non-blocking byte stream.
//!
//! Readers and writers never lose data to a timeout: a wait only times out
//! while no byte of the current frame has moved. Once a frame has started,
//! only an I/O error ends it early (and, for reads, a disable, in which case
//! the partial bytes stay buffered for the next call).

use std::io;
use std::os::fd::BorrowedFd;

use rustix::io::Errno;

use super::poll::{self, Gate, Interest, Ready};
use crate::error::{QueueError, Result};
use crate::timeout::Deadline;

const READ_CHUNK: usize = 4096;

/// Accumulates stream bytes and splits them into frames.
#[derive(Debug)]
pub(crate) struct FrameReader {
    separator: u8,
    buf: Vec<u8>,
    /// Prefix of `buf` already known to contain no separator.
    scanned: usize,
}

impl FrameReader {
    pub(crate) const fn new(separator: u8) -> Self {
        Self {
            separator,
            buf: Vec::new(),
            scanned: 0,
        }
    }

    /// Appends raw bytes received from the stream.
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes the next complete frame, without its separator.
    pub(crate) fn next_frame(&mut self) -> Option<Vec<u8>> {
        let offset = self.buf[self.scanned..]
            .iter()
            .position(|&b| b == self.separator);
        let Some(offset) = offset else {
            self.scanned = self.buf.len();
            return None;
        };
        let end = self.scanned + offset;
        let mut frame: Vec<u8> = self.buf.drain(..=end).collect();
        frame.pop();
        self.scanned = 0;
        Some(frame)
    }

    pub(crate) fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Forgets buffered bytes, e.g. after the stream was replaced.
    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    /// Reads whatever is available into the buffer.
    ///
    /// Returns `Ok(false)` if the read would block, `Ok(true)` on progress.
    /// End of stream is reported as `UnexpectedEof`.
    pub(crate) fn fill(&mut self, fd: BorrowedFd<'_>) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        match rustix::io::read(fd, &mut chunk) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed by peer",
            )),
            Ok(n) => {
                self.push(&chunk[..n]);
                Ok(true)
            }
            Err(Errno::AGAIN | Errno::INTR) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads one complete frame from `fd`.
    pub(crate) fn read_frame(
        &mut self,
        fd: BorrowedFd<'_>,
        gate: &Gate,
        deadline: &Deadline,
    ) -> Result<Vec<u8>> {
        loop {
            if !gate.is_open() {
                return Err(QueueError::Aborted);
            }
            if let Some(frame) = self.next_frame() {
                return Ok(frame);
            }
            let deadline = if self.has_partial() {
                &Deadline::NEVER
            } else {
                deadline
            };
            match poll::wait(fd, Interest::Read, Some(gate.waker()), deadline)? {
                Ready::TimedOut => return Err(QueueError::TimedOut),
                Ready::Woken => {}
                Ready::Io => {
                    self.fill(fd)?;
                }
            }
        }
    }

    /// Waits until a frame could be read, consuming nothing.
    ///
    /// Buffered bytes count as readable; so does a pending end of stream,
    /// which the next read reports.
    pub(crate) fn wait_readable(
        &self,
        fd: BorrowedFd<'_>,
        gate: &Gate,
        deadline: &Deadline,
    ) -> Result<()> {
        loop {
            if !gate.is_open() {
                return Err(QueueError::Aborted);
            }
            if self.has_partial() {
                return Ok(());
            }
            match poll::wait(fd, Interest::Read, Some(gate.waker()), deadline)? {
                Ready::TimedOut => return Err(QueueError::TimedOut),
                Ready::Woken => {}
                Ready::Io => return Ok(()),
            }
        }
    }
}

/// Writes `frame` (payload plus separator) to `fd`.
///
/// The deadline and the gate only apply until the first byte is written.
pub(crate) fn write_frame(
    fd: BorrowedFd<'_>,
    frame: &[u8],
    gate: &Gate,
    deadline: &Deadline,
) -> Result<()> {
    let mut written = 0;
    while written < frame.len() {
        let started = written > 0;
        if !started && !gate.is_open() {
            return Err(QueueError::Aborted);
        }
        let (waker, deadline) = if started {
            (None, &Deadline::NEVER)
        } else {
            (Some(gate.waker()), deadline)
        };
        match poll::wait(fd, Interest::Write, waker, deadline)? {
            Ready::TimedOut => return Err(QueueError::TimedOut),
            Ready::Woken => {}
            Ready::Io => match rustix::io::write(fd, &frame[written..]) {
                Ok(n) => written += n,
                Err(Errno::AGAIN | Errno::INTR) => {}
                Err(err) => return Err(err.into()),
            },
        }
    }
    Ok(())
}

/// Waits until `fd` accepts writes, writing nothing.
pub(crate) fn wait_writable(fd: BorrowedFd<'_>, gate: &Gate, deadline: &Deadline) -> Result<()> {
    loop {
        if !gate.is_open() {
            return Err(QueueError::Aborted);
        }
        match poll::wait(fd, Interest::Write, Some(gate.waker()), deadline)? {
            Ready::TimedOut => return Err(QueueError::TimedOut),
            Ready::Woken => {}
            Ready::Io => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::{AsFd, OwnedFd};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::timeout::Timeout;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let (r, w) = rustix::pipe::pipe().unwrap();
        poll::set_nonblocking(r.as_fd()).unwrap();
        poll::set_nonblocking(w.as_fd()).unwrap();
        (r, w)
    }

    #[test]
    fn splits_frames_across_pushes() {
        let mut reader = FrameReader::new(b'\n');
        reader.push(b"ab");
        assert_eq!(reader.next_frame(), None);
        reader.push(b"c\nde\n\nf");
        assert_eq!(reader.next_frame().unwrap(), b"abc");
        assert_eq!(reader.next_frame().unwrap(), b"de");
        assert_eq!(reader.next_frame().unwrap(), b"");
        assert_eq!(reader.next_frame(), None);
        assert!(reader.has_partial());
        reader.clear();
        assert!(!reader.has_partial());
    }

    #[test]
    fn reads_frames_written_in_pieces() {
        let (r, w) = pipe();
        let gate = Gate::new().unwrap();
        let mut reader = FrameReader::new(b'\n');

        let writer = thread::spawn(move || {
            for piece in [&b"hel"[..], b"lo\nwor", b"ld\n"] {
                rustix::io::write(&w, piece).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        });

        assert_eq!(reader.read_frame(r.as_fd(), &gate, &Deadline::NEVER).unwrap(), b"hello");
        assert_eq!(reader.read_frame(r.as_fd(), &gate, &Deadline::NEVER).unwrap(), b"world");
        writer.join().unwrap();
    }

    #[test]
    fn started_frame_ignores_the_timeout() {
        let (r, w) = pipe();
        let gate = Gate::new().unwrap();
        let mut reader = FrameReader::new(b'\n');

        rustix::io::write(&w, b"par").unwrap();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            rustix::io::write(&w, b"tial\n").unwrap();
        });

        let deadline = Timeout::from(Duration::from_millis(10)).start();
        assert_eq!(reader.read_frame(r.as_fd(), &gate, &deadline).unwrap(), b"partial");
        writer.join().unwrap();
    }

    #[test]
    fn idle_read_times_out_and_keeps_nothing() {
        let (r, _w) = pipe();
        let gate = Gate::new().unwrap();
        let mut reader = FrameReader::new(b'\n');
        let deadline = Timeout::from(Duration::from_millis(10)).start();
        assert!(reader.read_frame(r.as_fd(), &gate, &deadline).unwrap_err().is_timeout());
        assert!(!reader.has_partial());
    }

    #[test]
    fn aborted_read_keeps_partial_bytes() {
        let (r, w) = pipe();
        let gate = Gate::new().unwrap();
        let mut reader = FrameReader::new(b'\n');
        rustix::io::write(&w, b"half").unwrap();

        thread::scope(|s| {
            let handle = s.spawn(|| reader.read_frame(r.as_fd(), &gate, &Deadline::NEVER));
            thread::sleep(Duration::from_millis(20));
            gate.set_disabled(true);
            assert!(handle.join().unwrap().unwrap_err().is_aborted());
        });

        gate.set_disabled(false);
        rustix::io::write(&w, b"-done\n").unwrap();
        assert_eq!(reader.read_frame(r.as_fd(), &gate, &Deadline::NEVER).unwrap(), b"half-done");
    }

    #[test]
    fn end_of_stream_is_unexpected_eof() {
        let (r, w) = pipe();
        let gate = Gate::new().unwrap();
        let mut reader = FrameReader::new(b'\n');
        drop(w);
        match reader.read_frame(r.as_fd(), &gate, &Deadline::NEVER) {
            Err(QueueError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected eof, got {other:?}"),
        }
    }

    #[test]
    fn writes_frame_and_waits_for_writability() {
        let (r, w) = pipe();
        let gate = Gate::new().unwrap();
        wait_writable(w.as_fd(), &gate, &Deadline::NEVER).unwrap();
        write_frame(w.as_fd(), b"ping\n", &gate, &Deadline::NEVER).unwrap();

        let mut reader = FrameReader::new(b'\n');
        assert_eq!(reader.read_frame(r.as_fd(), &gate, &Deadline::NEVER).unwrap(), b"ping");

        gate.set_disabled(true);
        assert!(write_frame(w.as_fd(), b"x\n", &gate, &Deadline::NEVER).unwrap_err().is_aborted());
        assert!(wait_writable(w.as_fd(), &gate, &Deadline::NEVER).unwrap_err().is_aborted());
    }
}
