//! Network endpoint type.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use crate::error::BuildError;

/// A network endpoint (IP address + port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Creates a new endpoint from an IP address and port.
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    /// Creates a new IPv4 endpoint.
    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            port,
        )))
    }

    /// All interfaces (0.0.0.0) on the given port.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new_v4(0, 0, 0, 0, port)
    }

    /// Localhost on the given port. Port `0` lets the OS pick one.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new_v4(127, 0, 0, 1, port)
    }

    /// Resolves `host` and returns its first address.
    ///
    /// # Errors
    ///
    /// [`BuildError::Resolve`] if the lookup fails or yields nothing.
    pub fn resolve(host: &str, port: u16) -> Result<Self, BuildError> {
        Self::resolve_all(host, port)?
            .into_iter()
            .next()
            .ok_or_else(|| BuildError::Resolve {
                host: host.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            })
    }

    /// Resolves `host` to every address it maps to, in resolver order.
    ///
    /// # Errors
    ///
    /// [`BuildError::Resolve`] if the lookup fails.
    pub fn resolve_all(host: &str, port: u16) -> Result<Vec<Self>, BuildError> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|source| BuildError::Resolve {
                host: host.to_string(),
                source,
            })?;
        Ok(addrs.map(Self).collect())
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_any_and_localhost() {
        assert_eq!(Endpoint::any(9000).ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let ep = Endpoint::localhost(3000);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(ep.port(), 3000);
    }

    #[test]
    fn endpoint_display() {
        assert_eq!(Endpoint::new_v4(127, 0, 0, 1, 8080).to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn resolves_numeric_hosts() {
        let ep = Endpoint::resolve("127.0.0.1", 4000).unwrap();
        assert_eq!(ep, Endpoint::localhost(4000));
    }

    #[test]
    fn unresolvable_host_is_a_build_error() {
        let err = Endpoint::resolve("no such host.invalid", 1).unwrap_err();
        assert!(matches!(err, BuildError::Resolve { .. }));
    }
}
