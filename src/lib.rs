//! Client/server voice chat core: a hybrid reliable (TCP) + unreliable
//! (UDP) connection layer with NAT punch-through, a wire protocol of typed
//! messages, and a single-writer session dispatcher managing users,
//! channels, permissions and audio sources.

mod bytes;
mod connection;
mod consts;
mod dispatch;
mod error;
mod message;
mod session;
mod socket;
mod types;

pub mod client;
pub mod providers;
pub mod server;

#[cfg(test)]
mod testutil;

pub use client::{Client, ClientConfig, ClientEvent};
pub use connection::ConnectionState;
pub use consts::{
    DEFAULT_BITRATE, GLOBAL_SCOPE, MAX_AUDIO_FRAME_SIZE, MAX_BITRATE, MAX_DATAGRAM_SIZE,
    MIN_BITRATE, SANITY_BYTE,
};
pub use error::{Error, Result};
pub use message::Message;
pub use providers::{
    ChannelProvider, GuestPermissionProvider, GuestUserProvider, MemoryChannelProvider,
    PermissionProvider, ProviderLogin, UserProvider,
};
pub use server::{Server, ServerConfig};
pub use types::{
    ChannelChangeOutcome, ChannelEditAction, ChannelEditOutcome, ChannelInfo, DisconnectReason,
    KickOutcome, LoginOutcome, Permission, PermissionName, SourceInfo, SourceOutcome, UserInfo,
};
