use std::{io, net};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::info;

/// Socket options applied when binding a listener.
#[derive(Clone, Debug)]
pub struct ListenConfig {
    /// Accept queue length handed to `listen(2)`.
    pub backlog: u32,
    /// `SO_REUSEADDR`. Enabled by default so restarts do not trip over
    /// sockets lingering in TIME_WAIT.
    pub reuse_address: bool,
    /// `SO_REUSEPORT`. Off by default; enable it when several processes are
    /// meant to share one address and let the kernel spread accepts.
    pub reuse_port: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            backlog: 2048,
            reuse_address: true,
            reuse_port: false,
        }
    }
}

/// Bind a std listener for the given address.
///
/// The listener is left in blocking mode. Conversion to a tokio listener is
/// delayed until a runtime is available, see [into_tokio].
pub fn bind(addr: net::SocketAddr, config: &ListenConfig) -> io::Result<net::TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_address {
        socket.set_reuse_address(true)?;
    }
    #[cfg(unix)]
    if config.reuse_port {
        socket.set_reuse_port(true)?;
    }

    socket.bind(&SockAddr::from(addr))?;
    socket.listen(config.backlog as _)?;

    Ok(socket.into())
}

/// Convert a bound std listener into a tokio listener.
///
/// Must be called from within a tokio runtime.
pub fn into_tokio(listener: net::TcpListener) -> io::Result<tokio::net::TcpListener> {
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    info!("listening on {:?}", listener.local_addr().ok());
    Ok(listener)
}
