use std::time::Duration;

/// First byte of every frame on both transports.
pub const SANITY_BYTE: u8 = 0x2A;

pub const MAX_DATAGRAM_SIZE: usize = 1200;
pub const DATAGRAM_HEADER_SIZE: usize = 7; // 1 byte sanity, 4 bytes network id, 2 bytes type code
pub const MAX_AUDIO_FRAME_SIZE: usize = MAX_DATAGRAM_SIZE - DATAGRAM_HEADER_SIZE - 6; // 4 bytes source id, 2 bytes length

/// Permission scope meaning "all channels".
pub const GLOBAL_SCOPE: u32 = 0;

pub const DEFAULT_BITRATE: u32 = 32_000;
pub const MIN_BITRATE: u32 = 8_000;
pub const MAX_BITRATE: u32 = 128_000;
pub const AUDIO_CHANNELS: u8 = 1;
pub const AUDIO_FREQUENCY: u32 = 48_000;
pub const AUDIO_FRAME_SIZE: u32 = 960;

/// Keep-alive interval on the unreliable path once the connection has bled.
pub const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Interval between punch attempts while the unreliable path is unconfirmed.
pub const PUNCH_INTERVAL: Duration = Duration::from_secs(1);
/// Punch attempts before the client settles for reliable-only delivery.
pub const MAX_PUNCH_ATTEMPTS: u32 = 10;

/// Outbound messages queued for a single connection before it is considered
/// unresponsive and disconnected.
pub const MAX_OUTBOUND_QUEUE: usize = 1024;

pub(crate) const UDP_SEND_BUF_SIZE: usize = 4 * 1024 * 1024;
pub(crate) const UDP_RECV_BUF_SIZE: usize = 4 * 1024 * 1024;
pub(crate) const UDP_READ_TIMEOUT: Duration = Duration::from_millis(500);
pub(crate) const KEEPALIVE_TICK: Duration = Duration::from_millis(500);
