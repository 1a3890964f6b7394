/*!
Listener setup shared by the control and waveform servers.
*/

use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::info;

/// Pending connections; each server handles one client at a time
const LISTEN_BACKLOG: i32 = 1;

/// Resolve `bind_addr:port` to the first matching socket address
pub fn resolve(bind_addr: &str, port: u16) -> Result<SocketAddr> {
    (bind_addr, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve bind address {}:{}", bind_addr, port))?
        .next()
        .with_context(|| format!("No address found for {}:{}", bind_addr, port))
}

/// Bind a TCP listener with `SO_REUSEADDR` so restarts don't wait on TIME_WAIT
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let listener = TcpListener::from_std(socket.into())?;
    info!("🔌 Listening on {}", listener.local_addr()?);
    Ok(listener)
}
