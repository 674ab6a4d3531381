use std::io;
use std::net::{SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::consts::{UDP_READ_TIMEOUT, UDP_RECV_BUF_SIZE, UDP_SEND_BUF_SIZE};

#[derive(thiserror::Error, Debug)]
#[error("failed to create and bind udp socket: {0}")]
pub struct Error(#[from] std::io::Error);

pub type Result<T> = std::result::Result<T, Error>;

/// Binds the shared unreliable socket.
///
/// The socket stays in blocking mode; the receive loop relies on the read
/// timeout to notice shutdown. The client binds this to the same local
/// endpoint as its reliable stream so the NAT mapping matches.
pub(crate) fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_send_buffer_size(UDP_SEND_BUF_SIZE)?;
    socket.set_recv_buffer_size(UDP_RECV_BUF_SIZE)?;
    socket.bind(&addr.into())?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(UDP_READ_TIMEOUT))?;
    Ok(socket)
}

/// True for the error kinds a blocking `recv_from` returns when the read
/// timeout elapses with nothing to read.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
