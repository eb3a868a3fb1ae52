//! UDP socket setup

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Kernel receive buffer requested for the audio socket
pub const RECV_BUFFER_BYTES: usize = 1 << 20;

/// Bind a non-blocking UDP socket for the receive loop.
///
/// The receive buffer size is a hint; the kernel may cap it.
pub fn create_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
        tracing::debug!("Could not enlarge receive buffer: {}", e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
