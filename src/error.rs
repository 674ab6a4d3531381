use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Socket(#[from] crate::socket::Error),
    #[error("invalid sanity byte {0:#04x}")]
    BadSanityByte(u8),
    #[error("unknown message type code {0:#06x}")]
    UnknownType(u16),
    #[error("payload size exceeded, got {0} but max is {1}")]
    PayloadTooLarge(usize, usize),
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    #[error("connection is closed")]
    Disconnected,
    #[error("network id space exhausted")]
    NetworkIdsExhausted,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failure is the remote endpoint violating the wire
    /// protocol, as opposed to the transport failing underneath it.
    pub(crate) fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::BadSanityByte(_) | Error::UnknownType(_) | Error::Handshake(_)
        )
    }
}
