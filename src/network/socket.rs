//! UDP socket setup

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Bind a UDP socket on `addr`, optionally enlarging its receive buffer.
///
/// Port 0 binds an ephemeral port.
pub fn bind_socket(
    addr: SocketAddr,
    recv_buffer: Option<usize>,
) -> Result<UdpSocket, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::Bind(format!("socket: {}", e)))?;

    if let Some(size) = recv_buffer {
        // Not fatal: the OS may cap the size
        if let Err(e) = socket.set_recv_buffer_size(size) {
            warn!("Could not set receive buffer to {} bytes: {}", size, e);
        }
    }

    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::Bind(format!("{}: {}", addr, e)))?;

    let socket: UdpSocket = socket.into();
    if let Ok(local) = socket.local_addr() {
        debug!("UDP socket bound to {}", local);
    }
    Ok(socket)
}
