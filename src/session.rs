use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use crate::connection::ConnectionTable;
use crate::consts::{
    AUDIO_CHANNELS, AUDIO_FREQUENCY, AUDIO_FRAME_SIZE, DEFAULT_BITRATE, GLOBAL_SCOPE, MAX_BITRATE,
    MIN_BITRATE,
};
use crate::dispatch::{OutboundSink, SessionEvent};
use crate::message::Message;
use crate::providers::{ChannelProvider, PermissionProvider, UserProvider};
use crate::types::{
    ChannelChangeOutcome, ChannelEditAction, ChannelEditOutcome, ChannelInfo, DisconnectReason,
    KickOutcome, LoginOutcome, Permission, PermissionName, SourceInfo, SourceOutcome, UserInfo,
};

/// One logged-in user, bound to exactly one connection.
pub(crate) struct UserSession {
    pub connection: u32,
    pub user_id: u32,
    pub nickname: String,
    pub channel_id: u32,
    pub muted: bool,
}

impl UserSession {
    fn info(&self) -> UserInfo {
        UserInfo {
            user_id: self.user_id,
            nickname: self.nickname.clone(),
            channel_id: self.channel_id,
            muted: self.muted,
        }
    }
}

#[derive(Default)]
struct UserRegistry {
    by_conn: HashMap<u32, UserSession>,
    conn_by_user: HashMap<u32, u32>,
}

impl UserRegistry {
    fn insert(&mut self, session: UserSession) {
        self.conn_by_user.insert(session.user_id, session.connection);
        self.by_conn.insert(session.connection, session);
    }

    fn remove_by_conn(&mut self, connection: u32) -> Option<UserSession> {
        let session = self.by_conn.remove(&connection)?;
        self.conn_by_user.remove(&session.user_id);
        Some(session)
    }

    fn get(&self, connection: u32) -> Option<&UserSession> {
        self.by_conn.get(&connection)
    }

    fn get_mut(&mut self, connection: u32) -> Option<&mut UserSession> {
        self.by_conn.get_mut(&connection)
    }

    fn connection_of(&self, user_id: u32) -> Option<u32> {
        self.conn_by_user.get(&user_id).copied()
    }

    fn nickname_in_use(&self, nickname: &str) -> bool {
        self.by_conn.values().any(|s| s.nickname == nickname)
    }

    fn count_in_channel(&self, channel_id: u32) -> usize {
        self.by_conn
            .values()
            .filter(|s| s.channel_id == channel_id)
            .count()
    }

    fn connections(&self) -> Vec<u32> {
        self.by_conn.keys().copied().collect()
    }

    fn connections_in_channel(&self, channel_id: u32) -> Vec<u32> {
        self.by_conn
            .values()
            .filter(|s| s.channel_id == channel_id)
            .map(|s| s.connection)
            .collect()
    }

    fn infos(&self) -> Vec<UserInfo> {
        self.by_conn.values().map(UserSession::info).collect()
    }
}

struct ChannelRegistry {
    provider: Box<dyn ChannelProvider>,
    list: Vec<ChannelInfo>,
}

impl ChannelRegistry {
    fn new(mut provider: Box<dyn ChannelProvider>) -> Self {
        let list = provider.channels();
        Self { provider, list }
    }

    fn reload(&mut self) {
        self.list = self.provider.channels();
    }

    fn list(&self) -> &[ChannelInfo] {
        &self.list
    }

    fn get(&self, channel_id: u32) -> Option<&ChannelInfo> {
        self.list.iter().find(|c| c.id == channel_id)
    }

    fn default_channel(&mut self) -> ChannelInfo {
        if let Some(channel) = self.list.iter().find(|c| c.is_default) {
            return channel.clone();
        }
        // The backing store shrank underneath us; the provider recreates it.
        let channel = self.provider.default_channel();
        self.reload();
        channel
    }

    fn supports_updates(&self) -> bool {
        self.provider.supports_updates()
    }

    fn save(&mut self, channel: &ChannelInfo) -> ChannelEditOutcome {
        self.provider.save(channel)
    }

    fn delete(&mut self, channel_id: u32) -> ChannelEditOutcome {
        self.provider.delete(channel_id)
    }
}

struct PermissionCache {
    provider: Box<dyn PermissionProvider>,
    cache: HashMap<u32, Vec<Permission>>,
}

impl PermissionCache {
    fn new(provider: Box<dyn PermissionProvider>) -> Self {
        Self {
            provider,
            cache: HashMap::new(),
        }
    }

    /// Channel-scoped entries beat global entries; a permission with no
    /// entry at all is denied.
    fn check(&mut self, user_id: u32, name: PermissionName, channel_id: u32) -> bool {
        let provider = &mut self.provider;
        let perms = self
            .cache
            .entry(user_id)
            .or_insert_with(|| provider.permissions(user_id));
        let mut scoped = None;
        let mut global = None;
        for perm in perms.iter().filter(|p| p.name == name) {
            if perm.channel_id == channel_id && channel_id != GLOBAL_SCOPE {
                scoped = Some(perm.allowed);
            } else if perm.channel_id == GLOBAL_SCOPE {
                global = Some(perm.allowed);
            }
        }
        scoped.or(global).unwrap_or(false)
    }

    fn invalidate(&mut self, user_id: Option<u32>) {
        match user_id {
            Some(user_id) => {
                self.cache.remove(&user_id);
            }
            None => self.cache.clear(),
        }
    }
}

#[derive(Default)]
struct SourceRegistry {
    by_id: HashMap<u32, SourceInfo>,
    owned: HashMap<u32, Vec<u32>>,
    next_id: u32,
}

impl SourceRegistry {
    fn allocate(&mut self, connection: u32, owner_user_id: u32, bitrate: u32) -> Option<SourceInfo> {
        if self.next_id == u32::MAX {
            return None;
        }
        self.next_id += 1;
        let bitrate = if bitrate == 0 {
            DEFAULT_BITRATE
        } else {
            bitrate.clamp(MIN_BITRATE, MAX_BITRATE)
        };
        let source = SourceInfo {
            source_id: self.next_id,
            owner_user_id,
            bitrate,
            channels: AUDIO_CHANNELS,
            frequency: AUDIO_FREQUENCY,
            frame_size: AUDIO_FRAME_SIZE,
            muted: false,
        };
        self.by_id.insert(source.source_id, source.clone());
        self.owned.entry(connection).or_default().push(source.source_id);
        Some(source)
    }

    fn get(&self, source_id: u32) -> Option<&SourceInfo> {
        self.by_id.get(&source_id)
    }

    fn release_connection(&mut self, connection: u32) -> Vec<SourceInfo> {
        let Some(ids) = self.owned.remove(&connection) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| self.by_id.remove(&id))
            .collect()
    }

    fn infos(&self) -> Vec<SourceInfo> {
        self.by_id.values().cloned().collect()
    }
}

/// The server session core. Owned by the dispatcher thread; every mutation
/// of users, channels, permissions and sources happens here, in event
/// arrival order.
pub(crate) struct SessionState {
    connections: Arc<ConnectionTable>,
    out: OutboundSink,
    users: UserRegistry,
    channels: ChannelRegistry,
    permissions: PermissionCache,
    sources: SourceRegistry,
    user_provider: Box<dyn UserProvider>,
}

/// Drains the event queue until shutdown. The queue receiver is the wait
/// signal; an empty queue parks this thread.
pub(crate) fn run(events: Receiver<SessionEvent>, mut state: SessionState) {
    log::debug!("session dispatcher running");
    while let Ok(event) = events.recv() {
        match event {
            SessionEvent::Shutdown => break,
            event => state.handle(event),
        }
    }
    log::debug!("session dispatcher stopped");
}

impl SessionState {
    pub fn new(
        connections: Arc<ConnectionTable>,
        out: OutboundSink,
        user_provider: Box<dyn UserProvider>,
        channel_provider: Box<dyn ChannelProvider>,
        permission_provider: Box<dyn PermissionProvider>,
    ) -> Self {
        Self {
            connections,
            out,
            users: UserRegistry::default(),
            channels: ChannelRegistry::new(channel_provider),
            permissions: PermissionCache::new(permission_provider),
            sources: SourceRegistry::default(),
            user_provider,
        }
    }

    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected(connection) => {
                log::info!("connection {connection} established");
            }
            SessionEvent::Message {
                connection,
                message,
            } => {
                if !matches!(message, Message::AudioData { .. }) {
                    log::trace!(
                        "dispatching {:#06x} from connection {connection}",
                        message.type_code()
                    );
                }
                self.handle_message(connection, message);
            }
            SessionEvent::Connectionless { from, message } => {
                if let Message::Ping { nonce } = message {
                    log::trace!("connectionless ping from {from}");
                    self.out.send_datagram(from, 0, Message::Ping { nonce });
                }
            }
            SessionEvent::Disconnected { connection, reason } => self.cleanup(connection, reason),
            SessionEvent::ChannelsChanged => self.handle_channels_changed(),
            SessionEvent::PermissionsChanged { user_id } => self.permissions.invalidate(user_id),
            SessionEvent::Shutdown => {}
        }
    }

    fn handle_message(&mut self, connection: u32, message: Message) {
        match message {
            Message::Login {
                nickname,
                username,
                password,
            } => self.handle_login(connection, nickname, username, password),
            Message::Disconnect { .. } => self.cleanup(connection, DisconnectReason::Requested),
            Message::Ping { .. } => {} // keep-alive only
            Message::ChannelListRequest => {
                let list = self.channels.list().to_vec();
                self.out.send_to(connection, Message::ChannelList(list));
            }
            Message::ChannelChange {
                user_id,
                channel_id,
            } => self.handle_channel_change(connection, user_id, channel_id),
            Message::ChannelEdit { action, channel } => {
                self.handle_channel_edit(connection, action, channel)
            }
            Message::SourceRequest { bitrate } => self.handle_source_request(connection, bitrate),
            Message::Kick { user_id } => self.handle_kick(connection, user_id),
            Message::AudioData { source_id, frame } => {
                self.handle_audio(connection, source_id, frame)
            }
            // Client-bound traffic arriving at the server is a protocol
            // violation, never silently ignored.
            Message::Connect { .. }
            | Message::Punch
            | Message::PunchReceived
            | Message::Bleeding
            | Message::LoginResult { .. }
            | Message::UserLoggedIn(_)
            | Message::UserDisconnected { .. }
            | Message::UserList(_)
            | Message::KickResult { .. }
            | Message::ChannelList(_)
            | Message::ChannelEditResult { .. }
            | Message::ChannelChangeResult { .. }
            | Message::SourceResult { .. }
            | Message::SourceList(_) => {
                log::debug!(
                    "connection {connection} sent client-bound message {:#06x}, disconnecting",
                    message.type_code()
                );
                self.disconnect(connection, DisconnectReason::ProtocolViolation);
            }
        }
    }

    fn handle_login(
        &mut self,
        connection: u32,
        nickname: String,
        username: Option<String>,
        password: Option<String>,
    ) {
        let fail = |outcome| Message::LoginResult {
            outcome,
            user_id: 0,
        };
        if self.users.get(connection).is_some() {
            self.out
                .send_to(connection, fail(LoginOutcome::FailedAlreadyLoggedIn));
            return;
        }
        let nickname = nickname.trim().to_string();
        if nickname.is_empty() {
            self.out
                .send_to(connection, fail(LoginOutcome::FailedInvalidNickname));
            return;
        }
        // A registered nickname needs credentials.
        if username.is_none() && self.user_provider.exists(&nickname) {
            self.out
                .send_to(connection, fail(LoginOutcome::FailedWrongCredentials));
            return;
        }
        let login = self
            .user_provider
            .login(username.as_deref(), password.as_deref());
        if login.outcome != LoginOutcome::Success {
            self.out.send_to(connection, fail(login.outcome));
            return;
        }
        if !self
            .permissions
            .check(login.user_id, PermissionName::Login, GLOBAL_SCOPE)
        {
            self.out
                .send_to(connection, fail(LoginOutcome::FailedPermission));
            return;
        }
        if self.users.connection_of(login.user_id).is_some()
            || self.users.nickname_in_use(&nickname)
        {
            self.out
                .send_to(connection, fail(LoginOutcome::FailedNicknameInUse));
            return;
        }
        let channel_id = self.channels.default_channel().id;
        let session = UserSession {
            connection,
            user_id: login.user_id,
            nickname: nickname.clone(),
            channel_id,
            muted: false,
        };
        let info = session.info();
        self.users.insert(session);
        log::info!("user {nickname} (id {}) logged in on connection {connection}", login.user_id);
        self.out.send_to(
            connection,
            Message::LoginResult {
                outcome: LoginOutcome::Success,
                user_id: login.user_id,
            },
        );
        self.out
            .send_to(connection, Message::ChannelList(self.channels.list().to_vec()));
        self.out
            .send_to(connection, Message::UserList(self.users.infos()));
        self.out
            .send_to(connection, Message::SourceList(self.sources.infos()));
        self.broadcast(Message::UserLoggedIn(info), Some(connection));
    }

    fn handle_channel_change(&mut self, connection: u32, target_user: u32, channel_id: u32) {
        let fail = |outcome| Message::ChannelChangeResult {
            outcome,
            user_id: target_user,
            channel_id,
        };
        let Some(requester) = self.users.get(connection) else {
            self.out
                .send_to(connection, fail(ChannelChangeOutcome::FailedPermission));
            return;
        };
        let requester_user = requester.user_id;
        let self_move = target_user == 0 || target_user == requester_user;
        let target_conn = if self_move {
            connection
        } else {
            match self.users.connection_of(target_user) {
                Some(conn) => conn,
                None => {
                    self.out
                        .send_to(connection, fail(ChannelChangeOutcome::FailedUnknown));
                    return;
                }
            }
        };
        let Some(channel) = self.channels.get(channel_id).cloned() else {
            self.out
                .send_to(connection, fail(ChannelChangeOutcome::FailedUnknownChannel));
            return;
        };
        let needed = if self_move {
            PermissionName::ChangeChannel
        } else {
            PermissionName::ChangePlayersChannel
        };
        if !self.permissions.check(requester_user, needed, channel_id) {
            self.out
                .send_to(connection, fail(ChannelChangeOutcome::FailedPermission));
            return;
        }
        let already_there = self
            .users
            .get(target_conn)
            .is_some_and(|s| s.channel_id == channel_id);
        if channel.user_limit > 0
            && !already_there
            && self.users.count_in_channel(channel_id) >= channel.user_limit as usize
        {
            self.out
                .send_to(connection, fail(ChannelChangeOutcome::FailedChannelFull));
            return;
        }
        let Some(target) = self.users.get_mut(target_conn) else {
            self.out
                .send_to(connection, fail(ChannelChangeOutcome::FailedUnknown));
            return;
        };
        target.channel_id = channel_id;
        let moved_user = target.user_id;
        log::debug!("user {moved_user} moved to channel {channel_id}");
        self.broadcast(
            Message::ChannelChangeResult {
                outcome: ChannelChangeOutcome::Success,
                user_id: moved_user,
                channel_id,
            },
            None,
        );
    }

    fn handle_channel_edit(
        &mut self,
        connection: u32,
        action: ChannelEditAction,
        channel: ChannelInfo,
    ) {
        let outcome = self.apply_channel_edit(connection, action, &channel);
        if outcome == ChannelEditOutcome::Success {
            self.channels.reload();
            self.reassign_orphans();
            let list = self.channels.list().to_vec();
            self.broadcast(Message::ChannelList(list), None);
        }
        self.out
            .send_to(connection, Message::ChannelEditResult { outcome });
    }

    fn apply_channel_edit(
        &mut self,
        connection: u32,
        action: ChannelEditAction,
        channel: &ChannelInfo,
    ) -> ChannelEditOutcome {
        let Some(requester) = self.users.get(connection) else {
            return ChannelEditOutcome::FailedPermission;
        };
        let requester_user = requester.user_id;
        if !self.channels.supports_updates() {
            return ChannelEditOutcome::FailedNotSupported;
        }
        let needed = match action {
            ChannelEditAction::Add => PermissionName::AddChannel,
            ChannelEditAction::Edit => PermissionName::EditChannel,
            ChannelEditAction::Delete => PermissionName::DeleteChannel,
        };
        if !self.permissions.check(requester_user, needed, channel.id) {
            return ChannelEditOutcome::FailedPermission;
        }
        match action {
            ChannelEditAction::Add => {
                // The default flag is not grantable over the wire.
                let mut channel = channel.clone();
                channel.is_default = false;
                self.channels.save(&channel)
            }
            ChannelEditAction::Edit => {
                let Some(existing) = self.channels.get(channel.id) else {
                    return ChannelEditOutcome::FailedUnknownChannel;
                };
                if existing.read_only {
                    return ChannelEditOutcome::FailedReadOnly;
                }
                self.channels.save(channel)
            }
            ChannelEditAction::Delete => {
                let Some(existing) = self.channels.get(channel.id) else {
                    return ChannelEditOutcome::FailedUnknownChannel;
                };
                if existing.read_only {
                    return ChannelEditOutcome::FailedReadOnly;
                }
                if existing.is_default {
                    return ChannelEditOutcome::FailedDefaultChannel;
                }
                self.channels.delete(channel.id)
            }
        }
    }

    fn handle_channels_changed(&mut self) {
        log::debug!("channel backend changed, reloading");
        self.channels.reload();
        self.reassign_orphans();
        let list = self.channels.list().to_vec();
        self.broadcast(Message::ChannelList(list), None);
    }

    /// Moves every user whose channel vanished to the default channel, one
    /// change broadcast per affected user. Running this twice is a no-op.
    fn reassign_orphans(&mut self) {
        let default_id = self.channels.default_channel().id;
        let mut moved = Vec::new();
        for session in self.users.by_conn.values_mut() {
            if self.channels.list.iter().all(|c| c.id != session.channel_id) {
                session.channel_id = default_id;
                moved.push(session.user_id);
            }
        }
        for user_id in moved {
            log::debug!("user {user_id} reassigned to default channel {default_id}");
            self.broadcast(
                Message::ChannelChangeResult {
                    outcome: ChannelChangeOutcome::Success,
                    user_id,
                    channel_id: default_id,
                },
                None,
            );
        }
    }

    fn handle_source_request(&mut self, connection: u32, bitrate: u32) {
        let placeholder = SourceInfo {
            source_id: 0,
            owner_user_id: 0,
            bitrate: 0,
            channels: AUDIO_CHANNELS,
            frequency: AUDIO_FREQUENCY,
            frame_size: AUDIO_FRAME_SIZE,
            muted: false,
        };
        let Some(requester) = self.users.get(connection) else {
            self.out.send_to(
                connection,
                Message::SourceResult {
                    outcome: SourceOutcome::FailedPermission,
                    source: placeholder,
                },
            );
            return;
        };
        let user_id = requester.user_id;
        let channel_id = requester.channel_id;
        if !self
            .permissions
            .check(user_id, PermissionName::RequestSource, channel_id)
        {
            self.out.send_to(
                connection,
                Message::SourceResult {
                    outcome: SourceOutcome::FailedPermission,
                    source: placeholder,
                },
            );
            return;
        }
        let Some(source) = self.sources.allocate(connection, user_id, bitrate) else {
            log::error!("source id space exhausted");
            self.out.send_to(
                connection,
                Message::SourceResult {
                    outcome: SourceOutcome::FailedCapacity,
                    source: placeholder,
                },
            );
            return;
        };
        log::debug!(
            "source {} allocated for user {user_id} at {} bit/s",
            source.source_id,
            source.bitrate
        );
        self.out.send_to(
            connection,
            Message::SourceResult {
                outcome: SourceOutcome::Succeeded,
                source: source.clone(),
            },
        );
        self.broadcast(
            Message::SourceResult {
                outcome: SourceOutcome::NewSource,
                source,
            },
            Some(connection),
        );
    }

    /// The latency-critical path: no permission re-check, no logging, no
    /// per-recipient copy of the frame.
    fn handle_audio(&mut self, connection: u32, source_id: u32, frame: Arc<[u8]>) {
        let Some(sender) = self.users.get(connection) else {
            return;
        };
        let Some(source) = self.sources.get(source_id) else {
            return;
        };
        if source.owner_user_id != sender.user_id {
            log::trace!(
                "connection {connection} sent a frame for source {source_id} it does not own"
            );
            return;
        }
        if source.muted || sender.muted {
            return;
        }
        let channel_id = sender.channel_id;
        let message = Message::AudioData { source_id, frame };
        for conn in self.users.connections_in_channel(channel_id) {
            if conn != connection {
                self.out.send_to(conn, message.clone());
            }
        }
    }

    fn handle_kick(&mut self, connection: u32, target_user: u32) {
        let fail = |outcome| Message::KickResult {
            outcome,
            user_id: target_user,
        };
        let Some(requester) = self.users.get(connection) else {
            self.out
                .send_to(connection, fail(KickOutcome::FailedPermission));
            return;
        };
        let requester_user = requester.user_id;
        if !self
            .permissions
            .check(requester_user, PermissionName::KickUser, GLOBAL_SCOPE)
        {
            self.out
                .send_to(connection, fail(KickOutcome::FailedPermission));
            return;
        }
        let Some(target_conn) = self.users.connection_of(target_user) else {
            self.out
                .send_to(connection, fail(KickOutcome::FailedUnknownUser));
            return;
        };
        log::info!("user {target_user} kicked by user {requester_user}");
        self.out.send_to(
            connection,
            Message::KickResult {
                outcome: KickOutcome::Success,
                user_id: target_user,
            },
        );
        self.disconnect(target_conn, DisconnectReason::Kicked);
    }

    /// Dispatcher-initiated disconnect: the peer gets a notice before the
    /// stream closes. The notice and the close are queued in order, so the
    /// sender flushes one before acting on the other.
    fn disconnect(&mut self, connection: u32, reason: DisconnectReason) {
        if let Some(client) = self.connections.get(connection) {
            self.out.send(&client, Message::Disconnect { reason });
        }
        self.cleanup(connection, reason);
    }

    /// Removes the connection from every registry. Idempotent: a second
    /// disconnect of an already-absent connection is a no-op.
    fn cleanup(&mut self, connection: u32, reason: DisconnectReason) {
        let Some(client) = self.connections.remove(connection) else {
            return;
        };
        client.mark_dead();
        let released = self.sources.release_connection(connection);
        let user = self.users.remove_by_conn(connection);
        for source in released {
            self.broadcast(
                Message::SourceResult {
                    outcome: SourceOutcome::SourceRemoved,
                    source,
                },
                Some(connection),
            );
        }
        match user {
            Some(user) => {
                log::info!(
                    "user {} (id {}) disconnected: {reason:?}",
                    user.nickname,
                    user.user_id
                );
                self.permissions.invalidate(Some(user.user_id));
                self.broadcast(
                    Message::UserDisconnected {
                        user_id: user.user_id,
                        reason,
                    },
                    Some(connection),
                );
            }
            None => log::info!("connection {connection} closed: {reason:?}"),
        }
        self.out.close(client);
    }

    /// Sends to every logged-in connection except `except`.
    fn broadcast(&mut self, message: Message, except: Option<u32>) {
        for conn in self.users.connections() {
            if Some(conn) != except {
                self.out.send_to(conn, message.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RemoteClient;
    use crate::dispatch::Outbound;
    use crate::providers::{
        GuestPermissionProvider, GuestUserProvider, MemoryChannelProvider, ProviderLogin,
    };
    use crate::testutil::tcp_pair;
    use std::net::TcpStream;
    use std::sync::mpsc::{self, Receiver, Sender};

    /// Always returns the same user id; for login-exclusivity tests.
    struct FixedUserProvider(u32);
    impl UserProvider for FixedUserProvider {
        fn exists(&self, _username: &str) -> bool {
            false
        }
        fn login(&mut self, _username: Option<&str>, _password: Option<&str>) -> ProviderLogin {
            ProviderLogin {
                user_id: self.0,
                outcome: LoginOutcome::Success,
            }
        }
    }

    struct AllowAllPermissions;
    impl PermissionProvider for AllowAllPermissions {
        fn permissions(&mut self, _user_id: u32) -> Vec<Permission> {
            [
                PermissionName::Login,
                PermissionName::ChangeChannel,
                PermissionName::ChangePlayersChannel,
                PermissionName::AddChannel,
                PermissionName::EditChannel,
                PermissionName::DeleteChannel,
                PermissionName::RequestSource,
                PermissionName::KickUser,
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

    struct Harness {
        state: SessionState,
        connections: Arc<ConnectionTable>,
        events_tx: Sender<SessionEvent>,
        events_rx: Receiver<SessionEvent>,
        out_rx: Receiver<Outbound>,
        // Keeps the client-side stream halves open for the test's duration.
        peers: Vec<TcpStream>,
    }

    impl Harness {
        fn new(
            user_provider: Box<dyn UserProvider>,
            channel_provider: Box<dyn ChannelProvider>,
            permission_provider: Box<dyn PermissionProvider>,
        ) -> Self {
            let connections = Arc::new(ConnectionTable::new());
            let (out_tx, out_rx) = mpsc::channel();
            let (events_tx, events_rx) = mpsc::channel();
            let sink = OutboundSink::new(out_tx, events_tx.clone(), connections.clone());
            let state = SessionState::new(
                connections.clone(),
                sink,
                user_provider,
                channel_provider,
                permission_provider,
            );
            Self {
                state,
                connections,
                events_tx,
                events_rx,
                out_rx,
                peers: Vec::new(),
            }
        }

        fn guest() -> Self {
            Self::new(
                Box::new(GuestUserProvider::new()),
                Box::new(MemoryChannelProvider::new()),
                Box::new(GuestPermissionProvider),
            )
        }

        fn admin() -> Self {
            Self::new(
                Box::new(GuestUserProvider::new()),
                Box::new(MemoryChannelProvider::new()),
                Box::new(AllowAllPermissions),
            )
        }

        fn connect(&mut self) -> u32 {
            let id = self.connections.allocate_id().unwrap();
            let (server, peer) = tcp_pair();
            let addr = server.peer_addr().unwrap();
            self.peers.push(peer);
            self.connections
                .insert(Arc::new(RemoteClient::new(id, addr, server)));
            self.state.handle(SessionEvent::Connected(id));
            id
        }

        fn login(&mut self, connection: u32, nickname: &str) {
            self.state.handle(SessionEvent::Message {
                connection,
                message: Message::Login {
                    nickname: nickname.to_string(),
                    username: None,
                    password: None,
                },
            });
        }

        fn message(&mut self, connection: u32, message: Message) {
            self.state.handle(SessionEvent::Message {
                connection,
                message,
            });
        }

        /// Everything queued for connections so far, in order.
        fn drain(&mut self) -> Vec<(u32, Message)> {
            self.out_rx
                .try_iter()
                .filter_map(|out| match out {
                    Outbound::ToClient { client, message } => Some((client.id, message)),
                    _ => None,
                })
                .collect()
        }

        fn drain_for(&mut self, connection: u32) -> Vec<Message> {
            self.drain()
                .into_iter()
                .filter(|(conn, _)| *conn == connection)
                .map(|(_, msg)| msg)
                .collect()
        }
    }

    #[test]
    fn login_replies_with_result_then_lists() {
        let mut h = Harness::guest();
        let conn = h.connect();
        h.login(conn, "alice");
        let msgs = h.drain_for(conn);
        assert!(matches!(
            msgs[0],
            Message::LoginResult {
                outcome: LoginOutcome::Success,
                user_id: 1
            }
        ));
        assert!(matches!(msgs[1], Message::ChannelList(_)));
        assert!(matches!(msgs[2], Message::UserList(_)));
        assert!(matches!(msgs[3], Message::SourceList(_)));
        let Message::UserList(ref users) = msgs[2] else {
            unreachable!()
        };
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].nickname, "alice");
    }

    #[test]
    fn login_is_broadcast_to_others() {
        let mut h = Harness::guest();
        let first = h.connect();
        let second = h.connect();
        h.login(first, "alice");
        h.drain();
        h.login(second, "bob");
        let to_first = h.drain_for(first);
        assert!(to_first
            .iter()
            .any(|m| matches!(m, Message::UserLoggedIn(u) if u.nickname == "bob")));
    }

    #[test]
    fn duplicate_user_id_gets_nickname_in_use() {
        let mut h = Harness::new(
            Box::new(FixedUserProvider(7)),
            Box::new(MemoryChannelProvider::new()),
            Box::new(GuestPermissionProvider),
        );
        let first = h.connect();
        let second = h.connect();
        h.login(first, "alice");
        h.login(second, "bob");
        let first_msgs = h.drain_for(first);
        assert!(matches!(
            first_msgs[0],
            Message::LoginResult {
                outcome: LoginOutcome::Success,
                user_id: 7
            }
        ));
        let second_msgs = h.drain_for(second);
        assert!(matches!(
            second_msgs[0],
            Message::LoginResult {
                outcome: LoginOutcome::FailedNicknameInUse,
                ..
            }
        ));
    }

    #[test]
    fn duplicate_nickname_gets_nickname_in_use() {
        let mut h = Harness::guest();
        let first = h.connect();
        let second = h.connect();
        h.login(first, "alice");
        h.login(second, "alice");
        let msgs = h.drain_for(second);
        assert!(matches!(
            msgs[0],
            Message::LoginResult {
                outcome: LoginOutcome::FailedNicknameInUse,
                ..
            }
        ));
    }

    #[test]
    fn registered_nickname_requires_credentials() {
        struct Registered;
        impl UserProvider for Registered {
            fn exists(&self, username: &str) -> bool {
                username == "alice"
            }
            fn login(&mut self, _username: Option<&str>, _password: Option<&str>) -> ProviderLogin {
                ProviderLogin {
                    user_id: 1,
                    outcome: LoginOutcome::Success,
                }
            }
        }
        let mut h = Harness::new(
            Box::new(Registered),
            Box::new(MemoryChannelProvider::new()),
            Box::new(GuestPermissionProvider),
        );
        let conn = h.connect();
        h.login(conn, "alice");
        let msgs = h.drain_for(conn);
        assert!(matches!(
            msgs[0],
            Message::LoginResult {
                outcome: LoginOutcome::FailedWrongCredentials,
                ..
            }
        ));
    }

    #[test]
    fn empty_nickname_is_rejected() {
        let mut h = Harness::guest();
        let conn = h.connect();
        h.login(conn, "   ");
        let msgs = h.drain_for(conn);
        assert!(matches!(
            msgs[0],
            Message::LoginResult {
                outcome: LoginOutcome::FailedInvalidNickname,
                ..
            }
        ));
    }

    #[test]
    fn moving_another_user_requires_permission() {
        let mut h = Harness::guest();
        let (a, b) = (h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.drain();
        // Guests may not move other users.
        h.message(
            a,
            Message::ChannelChange {
                user_id: 2,
                channel_id: 1,
            },
        );
        let to_a = h.drain_for(a);
        assert!(matches!(
            to_a[0],
            Message::ChannelChangeResult {
                outcome: ChannelChangeOutcome::FailedPermission,
                ..
            }
        ));
    }

    #[test]
    fn unknown_channel_fails_only_to_requester() {
        let mut h = Harness::guest();
        let (a, b) = (h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.drain();
        h.message(
            a,
            Message::ChannelChange {
                user_id: 0,
                channel_id: 999,
            },
        );
        let to_a = h.drain_for(a);
        assert!(matches!(
            to_a[0],
            Message::ChannelChangeResult {
                outcome: ChannelChangeOutcome::FailedUnknownChannel,
                ..
            }
        ));
        assert!(h.drain_for(b).is_empty());
    }

    #[test]
    fn successful_change_is_broadcast() {
        let mut h = Harness::admin();
        let (a, b) = (h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.message(
            a,
            Message::ChannelEdit {
                action: ChannelEditAction::Add,
                channel: ChannelInfo {
                    id: 0,
                    name: "Ops".to_string(),
                    description: String::new(),
                    parent_id: 0,
                    read_only: false,
                    user_limit: 0,
                    is_default: false,
                },
            },
        );
        h.drain();
        h.message(
            a,
            Message::ChannelChange {
                user_id: 0,
                channel_id: 2,
            },
        );
        for conn in [a, b] {
            let msgs = h.drain_for(conn);
            assert!(
                msgs.iter().any(|m| matches!(
                    m,
                    Message::ChannelChangeResult {
                        outcome: ChannelChangeOutcome::Success,
                        user_id: 1,
                        channel_id: 2,
                    }
                )),
                "connection {conn} missed the broadcast"
            );
        }
    }

    #[test]
    fn channel_full_is_enforced() {
        let mut h = Harness::admin();
        let (a, b) = (h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.message(
            a,
            Message::ChannelEdit {
                action: ChannelEditAction::Add,
                channel: ChannelInfo {
                    id: 0,
                    name: "Booth".to_string(),
                    description: String::new(),
                    parent_id: 0,
                    read_only: false,
                    user_limit: 1,
                    is_default: false,
                },
            },
        );
        h.message(
            a,
            Message::ChannelChange {
                user_id: 0,
                channel_id: 2,
            },
        );
        h.drain();
        h.message(
            b,
            Message::ChannelChange {
                user_id: 0,
                channel_id: 2,
            },
        );
        let to_b = h.drain_for(b);
        assert!(matches!(
            to_b[0],
            Message::ChannelChangeResult {
                outcome: ChannelChangeOutcome::FailedChannelFull,
                ..
            }
        ));
    }

    #[test]
    fn guest_channel_edit_is_denied() {
        let mut h = Harness::guest();
        let conn = h.connect();
        h.login(conn, "alice");
        h.drain();
        h.message(
            conn,
            Message::ChannelEdit {
                action: ChannelEditAction::Add,
                channel: ChannelInfo {
                    id: 0,
                    name: "Ops".to_string(),
                    description: String::new(),
                    parent_id: 0,
                    read_only: false,
                    user_limit: 0,
                    is_default: false,
                },
            },
        );
        let msgs = h.drain_for(conn);
        assert!(matches!(
            msgs[0],
            Message::ChannelEditResult {
                outcome: ChannelEditOutcome::FailedPermission
            }
        ));
    }

    #[test]
    fn deleting_default_channel_is_refused() {
        let mut h = Harness::admin();
        let conn = h.connect();
        h.login(conn, "alice");
        h.drain();
        h.message(
            conn,
            Message::ChannelEdit {
                action: ChannelEditAction::Delete,
                channel: ChannelInfo {
                    id: 1,
                    name: String::new(),
                    description: String::new(),
                    parent_id: 0,
                    read_only: false,
                    user_limit: 0,
                    is_default: true,
                },
            },
        );
        let msgs = h.drain_for(conn);
        assert!(matches!(
            msgs[0],
            Message::ChannelEditResult {
                outcome: ChannelEditOutcome::FailedDefaultChannel
            }
        ));
    }

    #[test]
    fn channel_delete_reassigns_occupants_exactly_once() {
        let mut h = Harness::admin();
        let (a, b) = (h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.message(
            a,
            Message::ChannelEdit {
                action: ChannelEditAction::Add,
                channel: ChannelInfo {
                    id: 0,
                    name: "Doomed".to_string(),
                    description: String::new(),
                    parent_id: 0,
                    read_only: false,
                    user_limit: 0,
                    is_default: false,
                },
            },
        );
        h.message(
            b,
            Message::ChannelChange {
                user_id: 0,
                channel_id: 2,
            },
        );
        h.drain();
        let delete = Message::ChannelEdit {
            action: ChannelEditAction::Delete,
            channel: ChannelInfo {
                id: 2,
                name: String::new(),
                description: String::new(),
                parent_id: 0,
                read_only: false,
                user_limit: 0,
                is_default: false,
            },
        };
        h.message(a, delete.clone());
        let to_a = h.drain_for(a);
        let reassignments = to_a
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    Message::ChannelChangeResult {
                        outcome: ChannelChangeOutcome::Success,
                        user_id: 2,
                        channel_id: 1,
                    }
                )
            })
            .count();
        assert_eq!(reassignments, 1);

        // Processing the delete a second time must not move anyone again.
        h.message(a, delete);
        let to_a = h.drain_for(a);
        assert!(to_a
            .iter()
            .all(|m| !matches!(m, Message::ChannelChangeResult { .. })));
        assert!(matches!(
            to_a.last(),
            Some(Message::ChannelEditResult {
                outcome: ChannelEditOutcome::FailedUnknownChannel
            })
        ));
    }

    #[test]
    fn source_request_allocates_and_broadcasts() {
        let mut h = Harness::guest();
        let (a, b) = (h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.drain();
        h.message(a, Message::SourceRequest { bitrate: 0 });
        let to_a = h.drain_for(a);
        let Message::SourceResult {
            outcome: SourceOutcome::Succeeded,
            ref source,
        } = to_a[0]
        else {
            panic!("expected Succeeded, got {:?}", to_a[0]);
        };
        assert_eq!(source.source_id, 1);
        assert_eq!(source.bitrate, DEFAULT_BITRATE);
        assert_eq!(source.owner_user_id, 1);
        let to_b = h.drain_for(b);
        assert!(matches!(
            to_b[0],
            Message::SourceResult {
                outcome: SourceOutcome::NewSource,
                ..
            }
        ));
    }

    #[test]
    fn source_bitrate_is_clamped() {
        let mut h = Harness::guest();
        let conn = h.connect();
        h.login(conn, "alice");
        h.drain();
        h.message(
            conn,
            Message::SourceRequest {
                bitrate: 1_000_000,
            },
        );
        let msgs = h.drain_for(conn);
        let Message::SourceResult { ref source, .. } = msgs[0] else {
            panic!();
        };
        assert_eq!(source.bitrate, MAX_BITRATE);
    }

    #[test]
    fn audio_is_relayed_within_the_channel_only() {
        let mut h = Harness::admin();
        let (a, b, c) = (h.connect(), h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.login(c, "carol");
        h.message(a, Message::SourceRequest { bitrate: 0 });
        h.message(
            a,
            Message::ChannelEdit {
                action: ChannelEditAction::Add,
                channel: ChannelInfo {
                    id: 0,
                    name: "Aside".to_string(),
                    description: String::new(),
                    parent_id: 0,
                    read_only: false,
                    user_limit: 0,
                    is_default: false,
                },
            },
        );
        h.message(
            c,
            Message::ChannelChange {
                user_id: 0,
                channel_id: 2,
            },
        );
        h.drain();
        let frame: Arc<[u8]> = Arc::from(vec![1u8, 2, 3]);
        h.message(
            a,
            Message::AudioData {
                source_id: 1,
                frame: frame.clone(),
            },
        );
        let to_b = h.drain_for(b);
        assert!(matches!(to_b[0], Message::AudioData { source_id: 1, .. }));
        assert!(h.drain_for(a).is_empty());
        assert!(h.drain_for(c).is_empty());
    }

    #[test]
    fn forged_audio_frames_are_dropped() {
        let mut h = Harness::guest();
        let (a, b) = (h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.message(a, Message::SourceRequest { bitrate: 0 });
        h.drain();
        // Bob streams on Alice's source.
        h.message(
            b,
            Message::AudioData {
                source_id: 1,
                frame: Arc::from(vec![0u8; 4]),
            },
        );
        assert!(h.drain().is_empty());
    }

    #[test]
    fn disconnect_releases_sources_and_is_idempotent() {
        let mut h = Harness::guest();
        let (a, b) = (h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.message(a, Message::SourceRequest { bitrate: 0 });
        h.drain();
        h.state.handle(SessionEvent::Disconnected {
            connection: a,
            reason: DisconnectReason::TransportError,
        });
        let to_b = h.drain_for(b);
        assert!(to_b.iter().any(|m| matches!(
            m,
            Message::SourceResult {
                outcome: SourceOutcome::SourceRemoved,
                ..
            }
        )));
        assert!(to_b.iter().any(|m| matches!(
            m,
            Message::UserDisconnected {
                user_id: 1,
                reason: DisconnectReason::TransportError
            }
        )));
        assert!(h.connections.get(a).is_none());

        h.state.handle(SessionEvent::Disconnected {
            connection: a,
            reason: DisconnectReason::TransportError,
        });
        assert!(h.drain_for(b).is_empty());
    }

    #[test]
    fn kick_disconnects_the_target() {
        let mut h = Harness::admin();
        let (a, b) = (h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.drain();
        h.message(a, Message::Kick { user_id: 2 });
        let to_a = h.drain_for(a);
        assert!(matches!(
            to_a[0],
            Message::KickResult {
                outcome: KickOutcome::Success,
                user_id: 2
            }
        ));
        assert!(to_a.iter().any(|m| matches!(
            m,
            Message::UserDisconnected {
                user_id: 2,
                reason: DisconnectReason::Kicked
            }
        )));
        assert!(h.connections.get(b).is_none());
    }

    #[test]
    fn kick_without_permission_is_refused() {
        let mut h = Harness::guest();
        let (a, b) = (h.connect(), h.connect());
        h.login(a, "alice");
        h.login(b, "bob");
        h.drain();
        h.message(a, Message::Kick { user_id: 2 });
        let to_a = h.drain_for(a);
        assert!(matches!(
            to_a[0],
            Message::KickResult {
                outcome: KickOutcome::FailedPermission,
                ..
            }
        ));
        assert!(h.connections.get(b).is_some());
    }

    #[test]
    fn client_bound_message_disconnects_the_sender() {
        let mut h = Harness::guest();
        let conn = h.connect();
        h.message(
            conn,
            Message::LoginResult {
                outcome: LoginOutcome::Success,
                user_id: 1,
            },
        );
        assert!(h.connections.get(conn).is_none());
        let msgs = h.drain_for(conn);
        assert!(msgs.iter().any(|m| matches!(
            m,
            Message::Disconnect {
                reason: DisconnectReason::ProtocolViolation
            }
        )));
    }

    #[test]
    fn connectionless_ping_is_echoed() {
        let mut h = Harness::guest();
        let from = "127.0.0.1:5555".parse().unwrap();
        h.state.handle(SessionEvent::Connectionless {
            from,
            message: Message::Ping { nonce: 99 },
        });
        let echo = h.out_rx.try_iter().find_map(|out| match out {
            Outbound::Datagram {
                addr,
                network_id,
                message,
            } => Some((addr, network_id, message)),
            _ => None,
        });
        let (addr, network_id, message) = echo.expect("ping echo queued");
        assert_eq!(addr, from);
        assert_eq!(network_id, 0);
        assert_eq!(message, Message::Ping { nonce: 99 });
    }

    #[test]
    fn permission_cache_is_invalidated_on_notification() {
        // A provider that flips from deny-all to allow-all between calls.
        struct Flip(std::sync::atomic::AtomicBool);
        impl PermissionProvider for Flip {
            fn permissions(&mut self, _user_id: u32) -> Vec<Permission> {
                if self.0.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    AllowAllPermissions.permissions(0)
                } else {
                    vec![Permission {
                        name: PermissionName::Login,
                        channel_id: GLOBAL_SCOPE,
                        allowed: true,
                    }]
                }
            }
        }
        let mut h = Harness::new(
            Box::new(GuestUserProvider::new()),
            Box::new(MemoryChannelProvider::new()),
            Box::new(Flip(std::sync::atomic::AtomicBool::new(false))),
        );
        let conn = h.connect();
        h.login(conn, "alice");
        h.drain();
        h.message(conn, Message::SourceRequest { bitrate: 0 });
        let msgs = h.drain_for(conn);
        assert!(matches!(
            msgs[0],
            Message::SourceResult {
                outcome: SourceOutcome::FailedPermission,
                ..
            }
        ));
        // Until invalidated, the denial stays cached.
        h.state.handle(SessionEvent::PermissionsChanged { user_id: Some(1) });
        h.message(conn, Message::SourceRequest { bitrate: 0 });
        let msgs = h.drain_for(conn);
        assert!(matches!(
            msgs[0],
            Message::SourceResult {
                outcome: SourceOutcome::Succeeded,
                ..
            }
        ));
    }

    #[test]
    fn events_from_one_connection_apply_in_order() {
        use std::thread;
        let mut h = Harness::guest();
        let conn = h.connect();
        let events_tx = h.events_tx.clone();
        // Feed login + source request + disconnect through the real
        // dispatcher loop; side effects must land in arrival order.
        events_tx
            .send(SessionEvent::Message {
                connection: conn,
                message: Message::Login {
                    nickname: "alice".to_string(),
                    username: None,
                    password: None,
                },
            })
            .unwrap();
        events_tx
            .send(SessionEvent::Message {
                connection: conn,
                message: Message::SourceRequest { bitrate: 0 },
            })
            .unwrap();
        events_tx.send(SessionEvent::Shutdown).unwrap();
        let Harness {
            state,
            events_rx,
            out_rx,
            peers: _peers,
            ..
        } = h;
        let runner = thread::spawn(move || run(events_rx, state));
        runner.join().unwrap();
        let order: Vec<Message> = out_rx
            .try_iter()
            .filter_map(|out| match out {
                Outbound::ToClient { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert!(matches!(
            order[0],
            Message::LoginResult {
                outcome: LoginOutcome::Success,
                ..
            }
        ));
        // The source result arrives only after every login reply.
        assert!(matches!(
            order.last(),
            Some(Message::SourceResult {
                outcome: SourceOutcome::Succeeded,
                ..
            })
        ));
    }
}
