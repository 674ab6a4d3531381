use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bytes::{
    read_blob, read_list, read_opt_string, read_string, write_blob, write_list, write_opt_string,
    write_string, Bytes,
};
use crate::consts::{DATAGRAM_HEADER_SIZE, MAX_DATAGRAM_SIZE, SANITY_BYTE};
use crate::error::{Error, Result};
use crate::types::{
    ChannelChangeOutcome, ChannelEditAction, ChannelEditOutcome, ChannelInfo, DisconnectReason,
    KickOutcome, LoginOutcome, SourceInfo, SourceOutcome, UserInfo,
};

/// Every message exchanged between client and server.
///
/// Type codes are a stable protocol contract and are never renumbered.
/// Each variant is either reliable (stream) or unreliable (datagram); an
/// unreliable message queued for a connection whose NAT punch-through has
/// not completed is delivered over the stream instead.
///
/// # Example
/// ```
/// use voicelink::Message;
///
/// let msg = Message::Login {
///     nickname: "alice".to_string(),
///     username: None,
///     password: None,
/// };
/// let mut frame = Vec::new();
/// msg.write_stream(&mut frame).unwrap();
/// let decoded = Message::read_stream(&mut &frame[..]).unwrap();
/// assert_eq!(decoded, msg);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// First frame on every connection, server to client: the assigned
    /// network id used to demultiplex datagrams.
    Connect { network_id: u32 },
    /// Keep-alive on the unreliable path. Also accepted without an
    /// established session and echoed back, for discovery.
    Ping { nonce: u64 },
    /// Client asks the server to confirm its unreliable path.
    Punch,
    /// Server acknowledges a `Punch` over the same path.
    PunchReceived,
    /// Client confirms the round trip; the server marks the connection bled.
    Bleeding,
    Login {
        nickname: String,
        username: Option<String>,
        password: Option<String>,
    },
    LoginResult {
        outcome: LoginOutcome,
        user_id: u32,
    },
    /// Graceful disconnect notice, either direction.
    Disconnect { reason: DisconnectReason },
    UserLoggedIn(UserInfo),
    UserDisconnected {
        user_id: u32,
        reason: DisconnectReason,
    },
    UserList(Vec<UserInfo>),
    Kick { user_id: u32 },
    KickResult {
        outcome: KickOutcome,
        user_id: u32,
    },
    ChannelListRequest,
    ChannelList(Vec<ChannelInfo>),
    ChannelEdit {
        action: ChannelEditAction,
        channel: ChannelInfo,
    },
    ChannelEditResult { outcome: ChannelEditOutcome },
    /// `user_id` 0 moves the requester; anything else moves another user.
    ChannelChange { user_id: u32, channel_id: u32 },
    ChannelChangeResult {
        outcome: ChannelChangeOutcome,
        user_id: u32,
        channel_id: u32,
    },
    /// `bitrate` 0 requests the server default.
    SourceRequest { bitrate: u32 },
    SourceResult {
        outcome: SourceOutcome,
        source: SourceInfo,
    },
    SourceList(Vec<SourceInfo>),
    /// One encoded audio frame. The payload is shared so relay fan-out does
    /// not copy the frame per recipient.
    AudioData { source_id: u32, frame: Arc<[u8]> },
}

impl Message {
    pub fn type_code(&self) -> u16 {
        match self {
            Message::Connect { .. } => 0x0000,
            Message::Ping { .. } => 0x0001,
            Message::Punch => 0x0002,
            Message::PunchReceived => 0x0003,
            Message::Bleeding => 0x0004,
            Message::Login { .. } => 0x0010,
            Message::LoginResult { .. } => 0x0011,
            Message::Disconnect { .. } => 0x0012,
            Message::UserLoggedIn(_) => 0x0013,
            Message::UserDisconnected { .. } => 0x0014,
            Message::UserList(_) => 0x0015,
            Message::Kick { .. } => 0x0016,
            Message::KickResult { .. } => 0x0017,
            Message::ChannelListRequest => 0x0020,
            Message::ChannelList(_) => 0x0021,
            Message::ChannelEdit { .. } => 0x0022,
            Message::ChannelEditResult { .. } => 0x0023,
            Message::ChannelChange { .. } => 0x0024,
            Message::ChannelChangeResult { .. } => 0x0025,
            Message::SourceRequest { .. } => 0x0030,
            Message::SourceResult { .. } => 0x0031,
            Message::SourceList(_) => 0x0032,
            Message::AudioData { .. } => 0x0040,
        }
    }

    /// Whether the message must be delivered over the reliable channel.
    pub fn is_reliable(&self) -> bool {
        !matches!(
            self,
            Message::Ping { .. }
                | Message::Punch
                | Message::PunchReceived
                | Message::Bleeding
                | Message::AudioData { .. }
        )
    }

    /// Whether the server accepts this message from an endpoint with no
    /// established session.
    pub fn accepts_connectionless(&self) -> bool {
        matches!(self, Message::Ping { .. })
    }

    fn write_payload(&self, writer: &mut impl WriteBytesExt) -> Result<()> {
        match self {
            Message::Connect { network_id } => writer.write_u32::<LittleEndian>(*network_id)?,
            Message::Ping { nonce } => writer.write_u64::<LittleEndian>(*nonce)?,
            Message::Punch | Message::PunchReceived | Message::Bleeding => {}
            Message::Login {
                nickname,
                username,
                password,
            } => {
                write_string(writer, nickname)?;
                write_opt_string(writer, username)?;
                write_opt_string(writer, password)?;
            }
            Message::LoginResult { outcome, user_id } => {
                outcome.write_to(writer)?;
                writer.write_u32::<LittleEndian>(*user_id)?;
            }
            Message::Disconnect { reason } => reason.write_to(writer)?,
            Message::UserLoggedIn(user) => user.write_to(writer)?,
            Message::UserDisconnected { user_id, reason } => {
                writer.write_u32::<LittleEndian>(*user_id)?;
                reason.write_to(writer)?;
            }
            Message::UserList(users) => write_list(writer, users)?,
            Message::Kick { user_id } => writer.write_u32::<LittleEndian>(*user_id)?,
            Message::KickResult { outcome, user_id } => {
                outcome.write_to(writer)?;
                writer.write_u32::<LittleEndian>(*user_id)?;
            }
            Message::ChannelListRequest => {}
            Message::ChannelList(channels) => write_list(writer, channels)?,
            Message::ChannelEdit { action, channel } => {
                action.write_to(writer)?;
                channel.write_to(writer)?;
            }
            Message::ChannelEditResult { outcome } => outcome.write_to(writer)?,
            Message::ChannelChange {
                user_id,
                channel_id,
            } => {
                writer.write_u32::<LittleEndian>(*user_id)?;
                writer.write_u32::<LittleEndian>(*channel_id)?;
            }
            Message::ChannelChangeResult {
                outcome,
                user_id,
                channel_id,
            } => {
                outcome.write_to(writer)?;
                writer.write_u32::<LittleEndian>(*user_id)?;
                writer.write_u32::<LittleEndian>(*channel_id)?;
            }
            Message::SourceRequest { bitrate } => writer.write_u32::<LittleEndian>(*bitrate)?,
            Message::SourceResult { outcome, source } => {
                outcome.write_to(writer)?;
                source.write_to(writer)?;
            }
            Message::SourceList(sources) => write_list(writer, sources)?,
            Message::AudioData { source_id, frame } => {
                writer.write_u32::<LittleEndian>(*source_id)?;
                write_blob(writer, frame)?;
            }
        }
        Ok(())
    }

    fn read_payload(code: u16, reader: &mut impl ReadBytesExt) -> Result<Self> {
        Ok(match code {
            0x0000 => Message::Connect {
                network_id: reader.read_u32::<LittleEndian>()?,
            },
            0x0001 => Message::Ping {
                nonce: reader.read_u64::<LittleEndian>()?,
            },
            0x0002 => Message::Punch,
            0x0003 => Message::PunchReceived,
            0x0004 => Message::Bleeding,
            0x0010 => Message::Login {
                nickname: read_string(reader)?,
                username: read_opt_string(reader)?,
                password: read_opt_string(reader)?,
            },
            0x0011 => Message::LoginResult {
                outcome: LoginOutcome::read_from(reader)?,
                user_id: reader.read_u32::<LittleEndian>()?,
            },
            0x0012 => Message::Disconnect {
                reason: DisconnectReason::read_from(reader)?,
            },
            0x0013 => Message::UserLoggedIn(UserInfo::read_from(reader)?),
            0x0014 => Message::UserDisconnected {
                user_id: reader.read_u32::<LittleEndian>()?,
                reason: DisconnectReason::read_from(reader)?,
            },
            0x0015 => Message::UserList(read_list(reader)?),
            0x0016 => Message::Kick {
                user_id: reader.read_u32::<LittleEndian>()?,
            },
            0x0017 => Message::KickResult {
                outcome: KickOutcome::read_from(reader)?,
                user_id: reader.read_u32::<LittleEndian>()?,
            },
            0x0020 => Message::ChannelListRequest,
            0x0021 => Message::ChannelList(read_list(reader)?),
            0x0022 => Message::ChannelEdit {
                action: ChannelEditAction::read_from(reader)?,
                channel: ChannelInfo::read_from(reader)?,
            },
            0x0023 => Message::ChannelEditResult {
                outcome: ChannelEditOutcome::read_from(reader)?,
            },
            0x0024 => Message::ChannelChange {
                user_id: reader.read_u32::<LittleEndian>()?,
                channel_id: reader.read_u32::<LittleEndian>()?,
            },
            0x0025 => Message::ChannelChangeResult {
                outcome: ChannelChangeOutcome::read_from(reader)?,
                user_id: reader.read_u32::<LittleEndian>()?,
                channel_id: reader.read_u32::<LittleEndian>()?,
            },
            0x0030 => Message::SourceRequest {
                bitrate: reader.read_u32::<LittleEndian>()?,
            },
            0x0031 => Message::SourceResult {
                outcome: SourceOutcome::read_from(reader)?,
                source: SourceInfo::read_from(reader)?,
            },
            0x0032 => Message::SourceList(read_list(reader)?),
            0x0040 => Message::AudioData {
                source_id: reader.read_u32::<LittleEndian>()?,
                frame: Arc::from(read_blob(reader)?),
            },
            _ => return Err(Error::UnknownType(code)),
        })
    }

    /// Writes the message as a single stream frame: sanity byte, type code,
    /// payload.
    pub fn write_stream(&self, writer: &mut impl Write) -> Result<()> {
        let mut frame = Vec::with_capacity(64);
        frame.write_u8(SANITY_BYTE)?;
        frame.write_u16::<LittleEndian>(self.type_code())?;
        self.write_payload(&mut frame)?;
        writer.write_all(&frame)?;
        Ok(())
    }

    /// Reads one frame off the reliable stream. Blocks until a full frame
    /// is available. A sanity-byte mismatch or unknown type code is a fatal
    /// protocol violation for the connection.
    pub fn read_stream(reader: &mut impl Read) -> Result<Self> {
        let sanity = reader.read_u8()?;
        if sanity != SANITY_BYTE {
            return Err(Error::BadSanityByte(sanity));
        }
        let code = reader.read_u16::<LittleEndian>()?;
        Self::read_payload(code, reader)
    }

    /// Encodes the message as a datagram into `buf`: sanity byte, network
    /// id, type code, payload.
    pub fn write_datagram(&self, network_id: u32, buf: &mut Vec<u8>) -> Result<()> {
        buf.clear();
        buf.write_u8(SANITY_BYTE)?;
        buf.write_u32::<LittleEndian>(network_id)?;
        buf.write_u16::<LittleEndian>(self.type_code())?;
        self.write_payload(buf)?;
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::PayloadTooLarge(
                buf.len() - DATAGRAM_HEADER_SIZE,
                MAX_DATAGRAM_SIZE - DATAGRAM_HEADER_SIZE,
            ));
        }
        Ok(())
    }

    /// Decodes a datagram, returning the network id it claims and the
    /// message. Callers decide what a failed lookup of that id means; a
    /// malformed datagram is dropped by them, never a disconnect.
    pub fn read_datagram(data: &[u8]) -> Result<(u32, Self)> {
        let mut reader = data;
        let sanity = reader.read_u8()?;
        if sanity != SANITY_BYTE {
            return Err(Error::BadSanityByte(sanity));
        }
        let network_id = reader.read_u32::<LittleEndian>()?;
        let code = reader.read_u16::<LittleEndian>()?;
        let message = Self::read_payload(code, &mut reader)?;
        Ok((network_id, message))
    }
}
