use std::net::{TcpListener, TcpStream};

/// A connected stream pair over loopback: (accepted side, connecting side).
pub(crate) fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let connecting = TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    (accepted, connecting)
}
