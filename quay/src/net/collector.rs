//! Dequeue-only fan-in of frames sent by many TCP clients.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use super::listen::bind_listener;
use super::{DEFAULT_BACKLOG, Endpoint};
use crate::codec::{Codec, DEFAULT_SEPARATOR};
use crate::error::{BuildError, Result};
use crate::fd::stream::FrameReader;
use crate::memory::MemoryQueue;
use crate::queue::Dequeue;
use crate::timeout::{Deadline, Timeout};
use crate::trace::{debug, error, info, trace, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT: usize = 2;

const READ_CHUNK: usize = 4096;

/// Configuration for a [`CollectorQueue`].
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Address to listen on.
    pub bind: Endpoint,
    /// Pending-connection backlog passed to `listen(2)`.
    pub backlog: u32,
    /// Upper bound on one multiplexer wait.
    pub poll_interval: Duration,
    /// Byte terminating each frame sent by clients.
    pub separator: u8,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            bind: Endpoint::any(0),
            backlog: DEFAULT_BACKLOG,
            poll_interval: Duration::from_millis(100),
            separator: DEFAULT_SEPARATOR,
        }
    }
}

struct Shared<T> {
    items: MemoryQueue<T>,
    stop: AtomicBool,
    defunct: AtomicBool,
}

/// Collects frames from every connected client into one FIFO.
///
/// A background thread (`quay-collector`) accepts clients and reads from
/// all of them. Frames from one client keep their order; frames from
/// different clients interleave in arrival order. A client that errors or
/// disconnects is dropped without affecting the others. Frames that fail to
/// decode are logged and skipped.
///
/// If the multiplexer itself fails, the thread exits and the queue becomes
/// defunct: messages already collected can still be dequeued, after which
/// dequeues fail with [`QueueError::Defunct`](crate::QueueError::Defunct).
pub struct CollectorQueue<T> {
    shared: Arc<Shared<T>>,
    waker: Arc<Waker>,
    local_addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> CollectorQueue<T> {
    /// Binds the listening socket and starts the collector thread.
    ///
    /// # Errors
    ///
    /// [`BuildError::Bind`] if the address cannot be bound,
    /// [`BuildError::InvalidConfig`] for a zero poll interval, or failure to
    /// set up the multiplexer or spawn the thread.
    pub fn bind<C>(config: CollectorConfig, codec: C) -> std::result::Result<Self, BuildError>
    where
        C: Codec<T> + 'static,
    {
        if config.poll_interval.is_zero() {
            return Err(BuildError::InvalidConfig("poll_interval must be non-zero"));
        }
        let std_listener = bind_listener(config.bind, config.backlog)?;
        let local_addr = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let shared = Arc::new(Shared {
            items: MemoryQueue::unbounded(),
            stop: AtomicBool::new(false),
            defunct: AtomicBool::new(false),
        });

        let mut collector = Collector {
            poll,
            listener,
            clients: HashMap::new(),
            next_token: FIRST_CLIENT,
            shared: Arc::clone(&shared),
            codec,
            separator: config.separator,
            poll_interval: config.poll_interval,
            accept_retry: None,
        };

        debug!(addr = %local_addr, "spawning collector thread");
        let worker = thread::Builder::new()
            .name("quay-collector".into())
            .spawn(move || {
                info!("collector thread started");
                collector.run();
                info!("collector thread exiting");
            })
            .map_err(|source| BuildError::Spawn {
                name: "collector",
                source,
            })?;

        Ok(Self {
            shared,
            waker,
            local_addr,
            worker: Some(worker),
        })
    }
}

impl<T> CollectorQueue<T> {
    /// The bound address (useful with port `0`).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the collector thread died from a multiplexer failure.
    #[must_use]
    pub fn is_defunct(&self) -> bool {
        self.shared.defunct.load(Ordering::Acquire)
    }

    /// Number of collected messages not yet dequeued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.items.is_empty()
    }
}

impl<T> Dequeue<T> for CollectorQueue<T> {
    fn dequeue_with(&self, timeout: Timeout) -> Result<T> {
        self.shared.items.dequeue_with(timeout)
    }

    fn wait_dequeueable_with(&self, timeout: Timeout) -> Result<()> {
        self.shared.items.wait_dequeueable_with(timeout)
    }

    fn disable_dequeue(&self, disable: bool) {
        self.shared.items.disable_dequeue(disable);
    }
}

impl<T> Drop for CollectorQueue<T> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

struct Client {
    stream: TcpStream,
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    peer: SocketAddr,
    reader: FrameReader,
}

/// State owned by the collector thread.
struct Collector<T, C> {
    poll: Poll,
    listener: TcpListener,
    clients: HashMap<Token, Client>,
    next_token: usize,
    shared: Arc<Shared<T>>,
    codec: C,
    separator: u8,
    poll_interval: Duration,
    /// Set after `accept` failed for a reason other than `WouldBlock`.
    /// Readiness is edge-triggered, so connections left pending are only
    /// picked up by an explicit retry.
    accept_retry: Option<Deadline>,
}

impl<T, C: Codec<T>> Collector<T, C> {
    fn run(&mut self) {
        let mut events = Events::with_capacity(256);
        while !self.shared.stop.load(Ordering::Acquire) {
            if let Err(err) = self.poll.poll(&mut events, Some(self.poll_interval)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "collector multiplexer failed");
                self.shared.defunct.store(true, Ordering::Release);
                break;
            }
            for event in &events {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => {}
                    token => self.read_client(token),
                }
            }
            if self.accept_retry.is_some_and(|retry| retry.expired()) {
                self.accept_retry = None;
                self.accept_all();
            }
        }
        // Dropping the clients and the listener closes every socket.
        self.clients.clear();
        self.shared.items.close();
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(_err) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(peer = %peer, error = %_err, "failed to register client");
                        continue;
                    }
                    debug!(peer = %peer, clients = self.clients.len() + 1, "client connected");
                    self.clients.insert(
                        token,
                        Client {
                            stream,
                            peer,
                            reader: FrameReader::new(self.separator),
                        },
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_err) => {
                    // e.g. EMFILE: back off for one poll interval.
                    warn!(error = %_err, "accept failed, retrying later");
                    self.accept_retry = Some(Timeout::Duration(self.poll_interval).start());
                    return;
                }
            }
        }
    }

    fn read_client(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        let mut chunk = [0u8; READ_CHUNK];
        let outcome = loop {
            match client.stream.read(&mut chunk) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => client.reader.push(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Err(err),
            }
        };

        while let Some(frame) = client.reader.next_frame() {
            match self.codec.decode(&frame) {
                Ok(value) => self.shared.items.push_unbounded(value),
                Err(_err) => {
                    warn!(peer = %client.peer, error = %_err, "dropping undecodable frame");
                }
            }
        }

        if let Err(_err) = outcome {
            if let Some(mut client) = self.clients.remove(&token) {
                let _ = self.poll.registry().deregister(&mut client.stream);
                debug!(peer = %client.peer, error = %_err, "client disconnected");
            }
        } else {
            trace!(peer = %client.peer, queued = self.shared.items.len(), "client read");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;

    use super::*;
    use crate::codec::TextCodec;
    use crate::error::QueueError;

    fn collector() -> CollectorQueue<String> {
        let config = CollectorConfig {
            bind: Endpoint::localhost(0),
            poll_interval: Duration::from_millis(10),
            ..CollectorConfig::default()
        };
        CollectorQueue::bind(config, TextCodec::<String>::new()).unwrap()
    }

    #[test]
    fn collects_from_one_client_in_order() {
        let queue = collector();
        let mut client = StdTcpStream::connect(queue.local_addr()).unwrap();
        client.write_all(b"a\nb\nc\n").unwrap();

        for expected in ["a", "b", "c"] {
            assert_eq!(queue.dequeue_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
        assert!(!queue.is_defunct());
    }

    #[test]
    fn frames_split_across_writes_are_reassembled() {
        let queue = collector();
        let mut client = StdTcpStream::connect(queue.local_addr()).unwrap();
        client.write_all(b"hel").unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(30));
        client.write_all(b"lo\n").unwrap();
        assert_eq!(queue.dequeue_timeout(Duration::from_secs(5)).unwrap(), "hello");
    }

    #[test]
    fn disconnect_of_one_client_does_not_affect_others() {
        let queue = collector();
        let mut stays = StdTcpStream::connect(queue.local_addr()).unwrap();
        {
            let mut leaves = StdTcpStream::connect(queue.local_addr()).unwrap();
            leaves.write_all(b"bye\n").unwrap();
        }
        assert_eq!(queue.dequeue_timeout(Duration::from_secs(5)).unwrap(), "bye");
        stays.write_all(b"still here\n").unwrap();
        assert_eq!(queue.dequeue_timeout(Duration::from_secs(5)).unwrap(), "still here");
    }

    #[test]
    fn empty_collector_times_out_and_disable_aborts() {
        let queue = collector();
        assert!(queue.dequeue_timeout(Duration::from_millis(20)).unwrap_err().is_timeout());
        queue.disable_dequeue(true);
        assert!(matches!(queue.dequeue(), Err(QueueError::Aborted)));
    }

    #[test]
    fn undecodable_frames_are_skipped_and_the_client_stays() {
        let config = CollectorConfig {
            bind: Endpoint::localhost(0),
            poll_interval: Duration::from_millis(10),
            ..CollectorConfig::default()
        };
        let queue = CollectorQueue::bind(config, TextCodec::<u32>::new()).unwrap();
        let mut client = StdTcpStream::connect(queue.local_addr()).unwrap();
        client.write_all(b"1\nnot-a-number\n2\n").unwrap();

        assert_eq!(queue.dequeue_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(queue.dequeue_timeout(Duration::from_secs(5)).unwrap(), 2);
        client.write_all(b"3\n").unwrap();
        assert_eq!(queue.dequeue_timeout(Duration::from_secs(5)).unwrap(), 3);
    }

    #[test]
    fn drop_stops_the_worker_promptly() {
        let config = CollectorConfig {
            bind: Endpoint::localhost(0),
            poll_interval: Duration::from_secs(60),
            ..CollectorConfig::default()
        };
        let queue = CollectorQueue::bind(config, TextCodec::<u32>::new()).unwrap();
        let start = std::time::Instant::now();
        drop(queue);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
