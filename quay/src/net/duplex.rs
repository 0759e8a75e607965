//! Single-connection TCP queues.
//!
//! Both directions share one connection governed by a small state machine:
//!
//! ```text
//!            establish             op starts
//!   Idle ──────────────▶ Connected ─────────▶ Reading / Writing
//!    ▲                       ▲                       │
//!    │                       └── ok / timeout / abort┤
//!    └──────────────── I/O error (socket closed) ────┘
//! ```
//!
//! The server accepts its peer and the client connects lazily, on the first
//! operation that needs the connection. After an I/O error the next
//! operation establishes a new one. Operations are serialized by one mutex.

use std::io;
use std::marker::PhantomData;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::listen::bind_listener;
use super::{DEFAULT_BACKLOG, Endpoint};
use crate::codec::{Codec, DEFAULT_SEPARATOR};
use crate::error::{BuildError, QueueError, Result};
use crate::fd::poll::{self, Gate, Interest, Ready};
use crate::fd::stream::{self, FrameReader};
use crate::queue::{Dequeue, Enqueue};
use crate::timeout::{Deadline, Timeout};
use crate::trace::{debug, info};

/// Configuration for a [`ServerQueue`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind: Endpoint,
    /// Pending-connection backlog passed to `listen(2)`.
    pub backlog: u32,
    /// Byte terminating each frame in both directions.
    pub separator: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: Endpoint::any(0),
            backlog: DEFAULT_BACKLOG,
            separator: DEFAULT_SEPARATOR,
        }
    }
}

/// Configuration for a [`ClientQueue`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or address, resolved once at construction.
    pub host: String,
    pub port: u16,
    /// Byte terminating each frame in both directions.
    pub separator: u8,
    /// Upper bound for one connection attempt.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            separator: DEFAULT_SEPARATOR,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Connected,
    Reading,
    Writing,
}

/// How a duplex queue obtains its connection.
trait Establish: Send + Sync {
    fn establish(&self, gate: &Gate, deadline: &Deadline) -> Result<(TcpStream, SocketAddr)>;
}

/// Accepts the single peer of a [`ServerQueue`].
struct Acceptor {
    listener: TcpListener,
}

impl Establish for Acceptor {
    fn establish(&self, gate: &Gate, deadline: &Deadline) -> Result<(TcpStream, SocketAddr)> {
        loop {
            if !gate.is_open() {
                return Err(QueueError::Aborted);
            }
            match self.listener.accept() {
                Ok(accepted) => return Ok(accepted),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
            match poll::wait(self.listener.as_fd(), Interest::Read, Some(gate.waker()), deadline)? {
                Ready::TimedOut => return Err(QueueError::TimedOut),
                Ready::Woken | Ready::Io => {}
            }
        }
    }
}

/// Connects a [`ClientQueue`] to its server.
struct Dialer {
    addrs: Vec<SocketAddr>,
    connect_timeout: Duration,
}

impl Establish for Dialer {
    fn establish(&self, gate: &Gate, deadline: &Deadline) -> Result<(TcpStream, SocketAddr)> {
        let mut last_err = None;
        for addr in &self.addrs {
            if !gate.is_open() {
                return Err(QueueError::Aborted);
            }
            let limit = deadline.slice(self.connect_timeout);
            if limit.is_zero() {
                return Err(QueueError::TimedOut);
            }
            match TcpStream::connect_timeout(addr, limit) {
                Ok(stream) => return Ok((stream, *addr)),
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) if err.kind() == io::ErrorKind::TimedOut && deadline.expired() => {
                QueueError::TimedOut
            }
            Some(err) => err.into(),
            None => io::Error::new(io::ErrorKind::NotFound, "no address to connect to").into(),
        })
    }
}

struct Link {
    state: State,
    stream: Option<TcpStream>,
    reader: FrameReader,
}

impl Link {
    /// Returns the usable stream, establishing a connection first if idle.
    fn connect<E: Establish>(
        &mut self,
        establish: &E,
        gate: &Gate,
        deadline: &Deadline,
    ) -> Result<()> {
        if self.state != State::Idle {
            return Ok(());
        }
        let (stream, _peer) = establish.establish(gate, deadline)?;
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        info!(peer = %_peer, "connection established");
        self.stream = Some(stream);
        self.reader.clear();
        self.state = State::Connected;
        Ok(())
    }

    /// Settles the state after an operation on an established connection.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Err(QueueError::Io(_err)) => {
                debug!(error = %_err, "connection dropped");
                self.stream = None;
                self.reader.clear();
                self.state = State::Idle;
            }
            _ => self.state = State::Connected,
        }
        result
    }
}

/// Shared engine of [`ServerQueue`] and [`ClientQueue`].
struct Duplex<E> {
    establish: E,
    separator: u8,
    link: Mutex<Link>,
    enq_gate: Gate,
    deq_gate: Gate,
}

impl<E: Establish> Duplex<E> {
    fn new(establish: E, separator: u8) -> std::result::Result<Self, BuildError> {
        Ok(Self {
            establish,
            separator,
            link: Mutex::new(Link {
                state: State::Idle,
                stream: None,
                reader: FrameReader::new(separator),
            }),
            enq_gate: Gate::new()?,
            deq_gate: Gate::new()?,
        })
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `op` on an established connection in state `during`.
    fn with_stream<T>(
        &self,
        gate: &Gate,
        timeout: Timeout,
        during: State,
        op: impl FnOnce(&TcpStream, &mut FrameReader, &Deadline) -> Result<T>,
    ) -> Result<T> {
        let deadline = timeout.start();
        let mut link = self.link();
        if !gate.is_open() {
            return Err(QueueError::Aborted);
        }
        link.connect(&self.establish, gate, &deadline)?;
        link.state = during;
        let Link { stream, reader, .. } = &mut *link;
        let result = match stream {
            Some(stream) => op(stream, reader, &deadline),
            None => Err(io::Error::from(io::ErrorKind::NotConnected).into()),
        };
        link.settle(result)
    }

    fn read<T, C: Codec<T>>(&self, codec: &C, timeout: Timeout) -> Result<T> {
        let frame = self.with_stream(&self.deq_gate, timeout, State::Reading, |stream, reader, deadline| {
            reader.read_frame(stream.as_fd(), &self.deq_gate, deadline)
        })?;
        Ok(codec.decode(&frame)?)
    }

    fn wait_readable(&self, timeout: Timeout) -> Result<()> {
        self.with_stream(&self.deq_gate, timeout, State::Reading, |stream, reader, deadline| {
            reader.wait_readable(stream.as_fd(), &self.deq_gate, deadline)
        })
    }

    fn write<T, C: Codec<T>>(&self, codec: &C, value: &T, timeout: Timeout) -> Result<()> {
        let mut frame = Vec::new();
        codec.encode(value, &mut frame)?;
        frame.push(self.separator);
        self.with_stream(&self.enq_gate, timeout, State::Writing, |stream, _, deadline| {
            stream::write_frame(stream.as_fd(), &frame, &self.enq_gate, deadline)
        })
    }

    fn wait_writable(&self, timeout: Timeout) -> Result<()> {
        self.with_stream(&self.enq_gate, timeout, State::Writing, |stream, _, deadline| {
            stream::wait_writable(stream.as_fd(), &self.enq_gate, deadline)
        })
    }

    fn is_connected(&self) -> bool {
        self.link().state != State::Idle
    }
}

macro_rules! duplex_queue_impls {
    ($queue:ident) => {
        impl<T, C: Codec<T>> Enqueue<T> for $queue<T, C> {
            fn enqueue_with(&self, value: T, timeout: Timeout) -> Result<()> {
                self.duplex.write(&self.codec, &value, timeout)
            }

            fn wait_enqueueable_with(&self, timeout: Timeout) -> Result<()> {
                self.duplex.wait_writable(timeout)
            }

            fn disable_enqueue(&self, disable: bool) {
                self.duplex.enq_gate.set_disabled(disable);
            }
        }

        impl<T, C: Codec<T>> Dequeue<T> for $queue<T, C> {
            fn dequeue_with(&self, timeout: Timeout) -> Result<T> {
                self.duplex.read(&self.codec, timeout)
            }

            fn wait_dequeueable_with(&self, timeout: Timeout) -> Result<()> {
                self.duplex.wait_readable(timeout)
            }

            fn disable_dequeue(&self, disable: bool) {
                self.duplex.deq_gate.set_disabled(disable);
            }
        }

        impl<T, C> $queue<T, C> {
            /// Whether a connection is currently established.
            #[must_use]
            pub fn is_connected(&self) -> bool {
                self.duplex.is_connected()
            }
        }
    };
}

/// Full-duplex queue over the single peer accepted on a listening socket.
///
/// The listener is bound at construction; the peer is accepted by the first
/// operation. If the peer goes away, the next operation accepts a new one.
pub struct ServerQueue<T, C> {
    duplex: Duplex<Acceptor>,
    codec: C,
    local_addr: SocketAddr,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T, C: Codec<T>> ServerQueue<T, C> {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// [`BuildError::Bind`] if the address cannot be bound or listened on.
    pub fn bind(config: ServerConfig, codec: C) -> std::result::Result<Self, BuildError> {
        let listener = bind_listener(config.bind, config.backlog)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "server queue listening");
        Ok(Self {
            duplex: Duplex::new(Acceptor { listener }, config.separator)?,
            codec,
            local_addr,
            _marker: PhantomData,
        })
    }
}

impl<T, C> ServerQueue<T, C> {
    /// The bound address (useful with port `0`).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

duplex_queue_impls!(ServerQueue);

/// Full-duplex queue over a connection to a [`ServerQueue`] (or any peer
/// speaking the same framing).
///
/// The host is resolved at construction; the connection is made by the
/// first operation and re-made after failures.
pub struct ClientQueue<T, C> {
    duplex: Duplex<Dialer>,
    codec: C,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T, C: Codec<T>> ClientQueue<T, C> {
    /// Resolves the server address.
    ///
    /// # Errors
    ///
    /// [`BuildError::Resolve`] if the host does not resolve,
    /// [`BuildError::InvalidConfig`] for a zero connect timeout.
    pub fn new(config: ClientConfig, codec: C) -> std::result::Result<Self, BuildError> {
        if config.connect_timeout.is_zero() {
            return Err(BuildError::InvalidConfig("connect_timeout must be non-zero"));
        }
        let addrs = Endpoint::resolve_all(&config.host, config.port)?
            .into_iter()
            .map(SocketAddr::from)
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(BuildError::Resolve {
                host: config.host,
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            });
        }
        debug!(host = %config.host, port = config.port, "client queue resolved server");
        let dialer = Dialer {
            addrs,
            connect_timeout: config.connect_timeout,
        };
        Ok(Self {
            duplex: Duplex::new(dialer, config.separator)?,
            codec,
            _marker: PhantomData,
        })
    }
}

duplex_queue_impls!(ClientQueue);
