//! Listening sockets with an explicit backlog.

use std::io;
use std::net::{SocketAddr, TcpListener};

use rustix::net::{AddressFamily, SocketType, bind, listen, socket, sockopt};

use super::Endpoint;
use crate::error::BuildError;

/// Binds a non-blocking TCP listener on `endpoint` with `SO_REUSEADDR`.
pub(crate) fn bind_listener(endpoint: Endpoint, backlog: u32) -> Result<TcpListener, BuildError> {
    let addr = endpoint.as_socket_addr();
    open(addr, backlog).map_err(|source| BuildError::Bind { addr, source })
}

fn open(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::INET,
        SocketAddr::V6(_) => AddressFamily::INET6,
    };
    let fd = socket(family, SocketType::STREAM, None)?;
    sockopt::set_socket_reuseaddr(&fd, true)?;
    bind(&fd, &addr)?;
    listen(&fd, i32::try_from(backlog).unwrap_or(i32::MAX))?;
    let listener = TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}
