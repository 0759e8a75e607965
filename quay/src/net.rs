//! TCP transports.
//!
//! - [`ServerQueue`] and [`ClientQueue`]: one full-duplex connection, both
//!   directions, re-established after failures.
//! - [`CollectorQueue`]: dequeue-only fan-in from any number of clients.

mod collector;
mod duplex;
pub mod endpoint;
mod listen;

pub use collector::{CollectorConfig, CollectorQueue};
pub use duplex::{ClientConfig, ClientQueue, ServerConfig, ServerQueue};
pub use endpoint::Endpoint;

/// Default listen backlog for server and collector sockets.
pub const DEFAULT_BACKLOG: u32 = 16;
