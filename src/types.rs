use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bytes::{read_string, write_string, Bytes};

fn invalid(what: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what)
}

/// A voice channel as seen on the wire and in the server registry.
///
/// `parent_id` of 0 means the channel sits at the root; channel ids start
/// at 1. A `user_limit` of 0 means unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub parent_id: u32,
    pub read_only: bool,
    pub user_limit: u16,
    pub is_default: bool,
}

impl Bytes for ChannelInfo {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u32::<LittleEndian>(self.id)?;
        write_string(writer, &self.name)?;
        write_string(writer, &self.description)?;
        writer.write_u32::<LittleEndian>(self.parent_id)?;
        writer.write_u8(self.read_only as u8)?;
        writer.write_u16::<LittleEndian>(self.user_limit)?;
        writer.write_u8(self.is_default as u8)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            id: reader.read_u32::<LittleEndian>()?,
            name: read_string(reader)?,
            description: read_string(reader)?,
            parent_id: reader.read_u32::<LittleEndian>()?,
            read_only: reader.read_u8()? != 0,
            user_limit: reader.read_u16::<LittleEndian>()?,
            is_default: reader.read_u8()? != 0,
        })
    }
}

/// A logged-in user as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: u32,
    pub nickname: String,
    pub channel_id: u32,
    pub muted: bool,
}

impl Bytes for UserInfo {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u32::<LittleEndian>(self.user_id)?;
        write_string(writer, &self.nickname)?;
        writer.write_u32::<LittleEndian>(self.channel_id)?;
        writer.write_u8(self.muted as u8)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            user_id: reader.read_u32::<LittleEndian>()?,
            nickname: read_string(reader)?,
            channel_id: reader.read_u32::<LittleEndian>()?,
            muted: reader.read_u8()? != 0,
        })
    }
}

/// An allocated audio source. Encode/decode of the frames it carries is
/// delegated to the codec collaborator; this core only routes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub source_id: u32,
    pub owner_user_id: u32,
    pub bitrate: u32,
    pub channels: u8,
    pub frequency: u32,
    pub frame_size: u32,
    pub muted: bool,
}

impl Bytes for SourceInfo {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u32::<LittleEndian>(self.source_id)?;
        writer.write_u32::<LittleEndian>(self.owner_user_id)?;
        writer.write_u32::<LittleEndian>(self.bitrate)?;
        writer.write_u8(self.channels)?;
        writer.write_u32::<LittleEndian>(self.frequency)?;
        writer.write_u32::<LittleEndian>(self.frame_size)?;
        writer.write_u8(self.muted as u8)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            source_id: reader.read_u32::<LittleEndian>()?,
            owner_user_id: reader.read_u32::<LittleEndian>()?,
            bitrate: reader.read_u32::<LittleEndian>()?,
            channels: reader.read_u8()?,
            frequency: reader.read_u32::<LittleEndian>()?,
            frame_size: reader.read_u32::<LittleEndian>()?,
            muted: reader.read_u8()? != 0,
        })
    }
}

/// Actions a client may perform, checked against the permission provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionName {
    Login,
    ChangeChannel,
    ChangePlayersChannel,
    AddChannel,
    EditChannel,
    DeleteChannel,
    RequestSource,
    KickUser,
}

impl PermissionName {
    fn as_u8(self) -> u8 {
        match self {
            PermissionName::Login => 0,
            PermissionName::ChangeChannel => 1,
            PermissionName::ChangePlayersChannel => 2,
            PermissionName::AddChannel => 3,
            PermissionName::EditChannel => 4,
            PermissionName::DeleteChannel => 5,
            PermissionName::RequestSource => 6,
            PermissionName::KickUser => 7,
        }
    }
    fn from_u8(value: u8) -> Result<Self, io::Error> {
        Ok(match value {
            0 => PermissionName::Login,
            1 => PermissionName::ChangeChannel,
            2 => PermissionName::ChangePlayersChannel,
            3 => PermissionName::AddChannel,
            4 => PermissionName::EditChannel,
            5 => PermissionName::DeleteChannel,
            6 => PermissionName::RequestSource,
            7 => PermissionName::KickUser,
            _ => return Err(invalid("unknown permission name")),
        })
    }
}

/// A single permission entry. `channel_id` of [`GLOBAL_SCOPE`] applies
/// everywhere; a channel-scoped entry takes precedence over a global one.
///
/// [`GLOBAL_SCOPE`]: crate::GLOBAL_SCOPE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub name: PermissionName,
    pub channel_id: u32,
    pub allowed: bool,
}

impl Bytes for Permission {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u8(self.name.as_u8())?;
        writer.write_u32::<LittleEndian>(self.channel_id)?;
        writer.write_u8(self.allowed as u8)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            name: PermissionName::from_u8(reader.read_u8()?)?,
            channel_id: reader.read_u32::<LittleEndian>()?,
            allowed: reader.read_u8()? != 0,
        })
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl Bytes for $name {
            fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
                writer.write_u8(match self { $($name::$variant => $code),+ })
            }
            fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
                Ok(match reader.read_u8()? {
                    $($code => $name::$variant,)+
                    _ => return Err(invalid(concat!("unknown ", stringify!($name), " code"))),
                })
            }
        }
    };
}

wire_enum! {
    /// Result of a login attempt.
    LoginOutcome {
        Success = 0,
        FailedWrongCredentials = 1,
        FailedNicknameInUse = 2,
        FailedPermission = 3,
        FailedInvalidNickname = 4,
        FailedAlreadyLoggedIn = 5,
        FailedUnknown = 6,
    }
}

wire_enum! {
    /// Result of a channel change request. Successes are broadcast; failures
    /// go back to the requester only.
    ChannelChangeOutcome {
        Success = 0,
        FailedUnknownChannel = 1,
        FailedPermission = 2,
        FailedChannelFull = 3,
        FailedUnknown = 4,
    }
}

wire_enum! {
    ChannelEditAction {
        Add = 0,
        Edit = 1,
        Delete = 2,
    }
}

wire_enum! {
    /// Result of a channel add/edit/delete request.
    ChannelEditOutcome {
        Success = 0,
        FailedPermission = 1,
        FailedReadOnly = 2,
        FailedUnknownChannel = 3,
        FailedNotSupported = 4,
        FailedDefaultChannel = 5,
        FailedUnknown = 6,
    }
}

wire_enum! {
    /// Outcome carried by a `SourceResult` message. `Succeeded` answers the
    /// requester; `NewSource` and `SourceRemoved` are broadcast to everyone
    /// else.
    SourceOutcome {
        Succeeded = 0,
        FailedPermission = 1,
        FailedCapacity = 2,
        NewSource = 3,
        SourceRemoved = 4,
    }
}

wire_enum! {
    KickOutcome {
        Success = 0,
        FailedPermission = 1,
        FailedUnknownUser = 2,
    }
}

wire_enum! {
    /// Why a connection ended, where known.
    DisconnectReason {
        Unknown = 0,
        Requested = 1,
        ProtocolViolation = 2,
        TransportError = 3,
        Kicked = 4,
        ServerShutdown = 5,
        Congestion = 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip<T: Bytes + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = Vec::new();
        value.write_to(&mut buf).unwrap();
        let mut cursor = Cursor::new(&buf[..]);
        assert_eq!(T::read_from(&mut cursor).unwrap(), value);
    }

    #[test]
    fn channel_info_round_trip() {
        round_trip(ChannelInfo {
            id: 7,
            name: "Lobby".to_string(),
            description: String::new(),
            parent_id: 0,
            read_only: true,
            user_limit: 16,
            is_default: true,
        });
    }

    #[test]
    fn user_info_round_trip() {
        round_trip(UserInfo {
            user_id: 42,
            nickname: "alice".to_string(),
            channel_id: 1,
            muted: false,
        });
    }

    #[test]
    fn source_info_round_trip() {
        round_trip(SourceInfo {
            source_id: 1,
            owner_user_id: 42,
            bitrate: 32_000,
            channels: 1,
            frequency: 48_000,
            frame_size: 960,
            muted: false,
        });
    }

    #[test]
    fn permission_round_trip() {
        round_trip(Permission {
            name: PermissionName::ChangePlayersChannel,
            channel_id: 3,
            allowed: true,
        });
    }

    #[test]
    fn unknown_enum_code_is_an_error() {
        let buf = [200u8];
        let mut cursor = Cursor::new(&buf[..]);
        assert!(LoginOutcome::read_from(&mut cursor).is_err());
    }
}
