//! Pluggable backends for users, channels and permissions.
//!
//! The session core consumes these through narrow trait contracts; the
//! built-in implementations cover a server with no persistence: anyone may
//! log in as a guest, channels live in memory, and guests get a fixed
//! permission set. Persisted backends implement the same traits and notify
//! the server of external changes through [`Server::notify_channels_changed`]
//! and [`Server::notify_permissions_changed`].
//!
//! [`Server::notify_channels_changed`]: crate::Server::notify_channels_changed
//! [`Server::notify_permissions_changed`]: crate::Server::notify_permissions_changed

use crate::consts::GLOBAL_SCOPE;
use crate::types::{ChannelEditOutcome, ChannelInfo, LoginOutcome, Permission, PermissionName};

/// What the user backend decided about a login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderLogin {
    pub user_id: u32,
    pub outcome: LoginOutcome,
}

/// Credential backend. Called only from the dispatcher thread.
pub trait UserProvider: Send {
    fn exists(&self, username: &str) -> bool;
    fn login(&mut self, username: Option<&str>, password: Option<&str>) -> ProviderLogin;
}

/// Channel backend. The default channel must always exist; providers create
/// it lazily when their store is empty.
pub trait ChannelProvider: Send {
    fn channels(&mut self) -> Vec<ChannelInfo>;
    fn default_channel(&mut self) -> ChannelInfo;
    fn save(&mut self, channel: &ChannelInfo) -> ChannelEditOutcome;
    fn delete(&mut self, channel_id: u32) -> ChannelEditOutcome;
    /// Whether `save`/`delete` are supported at all. A read-only backend
    /// causes every edit request to fail with `FailedNotSupported`.
    fn supports_updates(&self) -> bool;
}

/// Permission backend. User id 0 is the unauthenticated class.
pub trait PermissionProvider: Send {
    fn permissions(&mut self, user_id: u32) -> Vec<Permission>;
}

/// Per-source audio codec, negotiated at source-request time from the
/// source's channel count, frequency and frame size. The session core
/// never looks inside a frame; it routes whatever this produces. Audio
/// front ends plug their codec in through this contract.
pub trait AudioCodec: Send {
    fn encode(&mut self, pcm: &[i16]) -> Vec<u8>;
    fn decode(&mut self, bytes: &[u8]) -> Vec<i16>;
}

/// Admits anyone without credentials and hands out sequential user ids.
pub struct GuestUserProvider {
    next_user_id: u32,
}

impl GuestUserProvider {
    pub fn new() -> Self {
        Self { next_user_id: 1 }
    }
}

impl Default for GuestUserProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl UserProvider for GuestUserProvider {
    fn exists(&self, _username: &str) -> bool {
        false
    }
    fn login(&mut self, _username: Option<&str>, _password: Option<&str>) -> ProviderLogin {
        let user_id = self.next_user_id;
        self.next_user_id += 1;
        ProviderLogin {
            user_id,
            outcome: LoginOutcome::Success,
        }
    }
}

/// In-memory channel store. Creates the default channel on first read.
pub struct MemoryChannelProvider {
    channels: Vec<ChannelInfo>,
    next_id: u32,
}

impl MemoryChannelProvider {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            next_id: 1,
        }
    }

    /// Seeds the store with channels, assigning ids to any entry with id 0.
    pub fn with_channels(channels: Vec<ChannelInfo>) -> Self {
        let mut provider = Self::new();
        for mut channel in channels {
            if channel.id == 0 {
                channel.id = provider.next_id;
            }
            provider.next_id = provider.next_id.max(channel.id + 1);
            provider.channels.push(channel);
        }
        provider
    }

    fn ensure_default(&mut self) {
        if self.channels.iter().any(|c| c.is_default) {
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.channels.push(ChannelInfo {
            id,
            name: "Lobby".to_string(),
            description: String::new(),
            parent_id: 0,
            read_only: false,
            user_limit: 0,
            is_default: true,
        });
    }
}

impl Default for MemoryChannelProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelProvider for MemoryChannelProvider {
    fn channels(&mut self) -> Vec<ChannelInfo> {
        self.ensure_default();
        self.channels.clone()
    }

    fn default_channel(&mut self) -> ChannelInfo {
        self.ensure_default();
        self.channels
            .iter()
            .find(|c| c.is_default)
            .cloned()
            .expect("default channel exists after ensure_default")
    }

    fn save(&mut self, channel: &ChannelInfo) -> ChannelEditOutcome {
        let mut channel = channel.clone();
        if channel.id == 0 {
            channel.id = self.next_id;
            self.next_id += 1;
            self.channels.push(channel);
            return ChannelEditOutcome::Success;
        }
        match self.channels.iter_mut().find(|c| c.id == channel.id) {
            Some(existing) => {
                // The default flag is not editable over the wire.
                channel.is_default = existing.is_default;
                *existing = channel;
                ChannelEditOutcome::Success
            }
            None => ChannelEditOutcome::FailedUnknownChannel,
        }
    }

    fn delete(&mut self, channel_id: u32) -> ChannelEditOutcome {
        let before = self.channels.len();
        self.channels.retain(|c| c.id != channel_id);
        if self.channels.len() == before {
            ChannelEditOutcome::FailedUnknownChannel
        } else {
            ChannelEditOutcome::Success
        }
    }

    fn supports_updates(&self) -> bool {
        true
    }
}

/// Fixed permission set for servers without a permission backend: guests
/// may log in, move themselves and stream audio; everything else is denied.
pub struct GuestPermissionProvider;

impl PermissionProvider for GuestPermissionProvider {
    fn permissions(&mut self, _user_id: u32) -> Vec<Permission> {
        [
            PermissionName::Login,
            PermissionName::ChangeChannel,
            PermissionName::RequestSource,
        ]
        .into_iter()
        .map(|name| Permission {
            name,
            channel_id: GLOBAL_SCOPE,
            allowed: true,
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_logins_get_distinct_user_ids() {
        let mut provider = GuestUserProvider::new();
        let first = provider.login(None, None);
        let second = provider.login(None, None);
        assert_eq!(first.outcome, LoginOutcome::Success);
        assert_eq!(second.outcome, LoginOutcome::Success);
        assert_ne!(first.user_id, second.user_id);
    }

    #[test]
    fn default_channel_is_created_lazily() {
        let mut provider = MemoryChannelProvider::new();
        let default = provider.default_channel();
        assert!(default.is_default);
        assert_eq!(provider.channels().len(), 1);
    }

    #[test]
    fn save_assigns_ids_and_edits_in_place() {
        let mut provider = MemoryChannelProvider::new();
        let default = provider.default_channel();
        let outcome = provider.save(&ChannelInfo {
            id: 0,
            name: "Ops".to_string(),
            description: String::new(),
            parent_id: default.id,
            read_only: false,
            user_limit: 4,
            is_default: false,
        });
        assert_eq!(outcome, ChannelEditOutcome::Success);
        let ops = provider
            .channels()
            .into_iter()
            .find(|c| c.name == "Ops")
            .unwrap();
        assert_ne!(ops.id, 0);

        let mut edited = ops.clone();
        edited.user_limit = 8;
        assert_eq!(provider.save(&edited), ChannelEditOutcome::Success);
        assert_eq!(
            provider
                .channels()
                .into_iter()
                .find(|c| c.id == ops.id)
                .unwrap()
                .user_limit,
            8
        );
    }

    #[test]
    fn delete_unknown_channel_fails() {
        let mut provider = MemoryChannelProvider::new();
        assert_eq!(
            provider.delete(999),
            ChannelEditOutcome::FailedUnknownChannel
        );
    }
}
