use std::io::BufReader;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::connection::ConnectionState;
use crate::consts::{
    KEEPALIVE_TICK, MAX_AUDIO_FRAME_SIZE, MAX_DATAGRAM_SIZE, MAX_PUNCH_ATTEMPTS, PING_INTERVAL,
    PUNCH_INTERVAL,
};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::socket;
use crate::types::{
    ChannelChangeOutcome, ChannelEditAction, ChannelEditOutcome, ChannelInfo, DisconnectReason,
    KickOutcome, LoginOutcome, SourceInfo, SourceOutcome, UserInfo,
};

/// How long to wait for the server's network id assignment.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Callback<Ctx> = Box<dyn FnMut(ConnectionState, ConnectionState, &mut Ctx) + Send + 'static>;

/// Configuration for a client.
///
/// * `disable_punch_through` - never attempt the NAT handshake; everything
///   travels over the reliable stream. For networks that filter UDP.
/// * `on_state_change` - a callback invoked for every connection state
///   transition, fired while the event queue is drained.
///
/// # Example
/// ```no_run
/// use voicelink::{ClientConfig, Client, ConnectionState};
///
/// let cfg = ClientConfig::with_context(0u32).on_state_change(|from, to, ctx| {
///     *ctx += 1;
///     if let (ConnectionState::Established, ConnectionState::Bled) = (from, to) {
///         println!("unreliable path confirmed");
///     }
/// });
/// let client = Client::with_config("127.0.0.1:4242", cfg).unwrap();
/// ```
pub struct ClientConfig<Ctx = ()> {
    punch_through: bool,
    context: Ctx,
    on_state_change: Option<Callback<Ctx>>,
}

impl Default for ClientConfig<()> {
    fn default() -> Self {
        Self {
            punch_through: true,
            context: (),
            on_state_change: None,
        }
    }
}

impl ClientConfig<()> {
    /// Create a new, default client configuration with no context.
    pub fn new() -> ClientConfig<()> {
        ClientConfig::default()
    }
}

impl<Ctx> ClientConfig<Ctx> {
    /// Create a new client configuration with context that will be passed
    /// to the callbacks.
    pub fn with_context(ctx: Ctx) -> Self {
        Self {
            punch_through: true,
            context: ctx,
            on_state_change: None,
        }
    }
    /// Never attempt the NAT punch-through handshake. The connection stays
    /// `Established` and all traffic uses the reliable stream.
    pub fn disable_punch_through(mut self) -> Self {
        self.punch_through = false;
        self
    }
    /// Set a callback that will be called when the client changes states.
    pub fn on_state_change<F>(mut self, cb: F) -> Self
    where
        F: FnMut(ConnectionState, ConnectionState, &mut Ctx) + Send + 'static,
    {
        self.on_state_change = Some(Box::new(cb));
        self
    }
}

/// What the server told us, surfaced in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The handshake completed and the server assigned a network id.
    Connected { network_id: u32 },
    LoginResult {
        outcome: LoginOutcome,
        user_id: u32,
    },
    ChannelList(Vec<ChannelInfo>),
    UserList(Vec<UserInfo>),
    SourceList(Vec<SourceInfo>),
    UserLoggedIn(UserInfo),
    UserDisconnected {
        user_id: u32,
        reason: DisconnectReason,
    },
    ChannelChangeResult {
        outcome: ChannelChangeOutcome,
        user_id: u32,
        channel_id: u32,
    },
    ChannelEditResult { outcome: ChannelEditOutcome },
    KickResult {
        outcome: KickOutcome,
        user_id: u32,
    },
    SourceResult {
        outcome: SourceOutcome,
        source: SourceInfo,
    },
    /// One encoded audio frame for a source someone else owns.
    Audio { source_id: u32, frame: Arc<[u8]> },
    /// Terminal; no further events follow.
    Disconnected { reason: DisconnectReason },
}

enum Internal {
    Event(ClientEvent),
    State(ConnectionState, ConnectionState),
}

enum ClientOutbound {
    Message(Message),
    Shutdown,
}

struct ClientShared {
    network_id: AtomicU32,
    state: Mutex<ConnectionState>,
    bleeding: AtomicBool,
    alive: AtomicBool,
    ping_nonce: AtomicU64,
}

impl ClientShared {
    fn new() -> Self {
        Self {
            network_id: AtomicU32::new(0),
            state: Mutex::new(ConnectionState::Connecting),
            bleeding: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            ping_nonce: AtomicU64::new(0),
        }
    }

    fn network_id(&self) -> u32 {
        self.network_id.load(Ordering::Acquire)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn mark_dead(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    fn is_bleeding(&self) -> bool {
        self.bleeding.load(Ordering::Acquire)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn transition(&self, to: ConnectionState, events: &Sender<Internal>) {
        let mut state = self.state.lock().unwrap();
        let from = *state;
        if from == to || from == ConnectionState::Disconnected {
            return;
        }
        *state = to;
        drop(state);
        log::debug!("client state changing from {from:?} to {to:?}");
        let _ = events.send(Internal::State(from, to));
    }

    fn fail(&self, reason: DisconnectReason, events: &Sender<Internal>) {
        if self.mark_dead() {
            self.transition(ConnectionState::Disconnected, events);
            let _ = events.send(Internal::Event(ClientEvent::Disconnected { reason }));
        }
    }
}

/// The `voicelink` client.
///
/// Connects the reliable stream, binds its unreliable socket to the same
/// local endpoint so the NAT mapping matches, reads the server-assigned
/// network id, and then services both transports on background threads.
/// The application consumes one ordered event queue.
///
/// # Example
/// ```no_run
/// use voicelink::{Client, ClientEvent};
/// use std::time::Duration;
///
/// let mut client = Client::connect("127.0.0.1:4242").unwrap();
/// client.login("alice", None, None).unwrap();
/// while let Some(event) = client.recv_timeout(Duration::from_secs(1)) {
///     if let ClientEvent::LoginResult { outcome, user_id } = event {
///         println!("login: {outcome:?} (user {user_id})");
///         break;
///     }
/// }
/// ```
pub struct Client<Ctx = ()> {
    shared: Arc<ClientShared>,
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    stream: TcpStream,
    events: Receiver<Internal>,
    outbound: Sender<ClientOutbound>,
    cfg: ClientConfig<Ctx>,
    sender_thread: Option<JoinHandle<()>>,
    other_threads: Vec<JoinHandle<()>>,
}

impl<Ctx> std::fmt::Debug for Client<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_addr", &self.server_addr)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Client<()> {
    /// Connect with a default configuration.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::with_config(addr, ClientConfig::default())
    }
}

impl<Ctx> Client<Ctx> {
    /// Connect with a custom configuration. Blocks until the server assigns
    /// a network id, or fails after a few seconds without one.
    pub fn with_config(addr: impl ToSocketAddrs, cfg: ClientConfig<Ctx>) -> Result<Self> {
        let server_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no socket addresses found")
            })?;
        let stream = TcpStream::connect(server_addr)?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        // Same local endpoint for both transports, so the NAT sees one peer.
        let udp = socket::bind_udp(local_addr)?;

        let (events_tx, events_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        let shared = Arc::new(ClientShared::new());
        shared.transition(ConnectionState::Handshaking, &events_tx);

        let mut reader = BufReader::new(stream.try_clone()?);
        stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;
        let network_id = match Message::read_stream(&mut reader) {
            Ok(Message::Connect { network_id }) => network_id,
            Ok(_) => return Err(Error::Handshake("expected network id assignment")),
            Err(Error::Io(e)) if socket::is_timeout(&e) => {
                return Err(Error::Handshake("timed out waiting for network id"))
            }
            Err(e) => return Err(e),
        };
        stream.set_read_timeout(None)?;
        shared.network_id.store(network_id, Ordering::Release);
        shared.transition(ConnectionState::Established, &events_tx);
        let _ = events_tx.send(Internal::Event(ClientEvent::Connected { network_id }));
        log::info!("client connected to {server_addr} as connection {network_id}");

        let mut other_threads = Vec::new();
        let sender_thread = {
            let stream = stream.try_clone()?;
            let udp = udp.try_clone()?;
            let shared = shared.clone();
            let events = events_tx.clone();
            thread::Builder::new()
                .name("vl-send".to_string())
                .spawn(move || run_sender(out_rx, stream, udp, server_addr, shared, events))?
        };
        {
            let shared = shared.clone();
            let events = events_tx.clone();
            other_threads.push(
                thread::Builder::new()
                    .name("vl-read".to_string())
                    .spawn(move || run_reader(reader, shared, events))?,
            );
        }
        {
            let shared = shared.clone();
            let events = events_tx.clone();
            let out = out_tx.clone();
            other_threads.push(
                thread::Builder::new()
                    .name("vl-udp".to_string())
                    .spawn(move || run_udp(udp, server_addr, shared, events, out))?,
            );
        }
        {
            let shared = shared.clone();
            let out = out_tx.clone();
            let punch_through = cfg.punch_through;
            other_threads.push(
                thread::Builder::new()
                    .name("vl-keepalive".to_string())
                    .spawn(move || run_keepalive(out, shared, punch_through))?,
            );
        }
        if cfg.punch_through {
            let _ = out_tx.send(ClientOutbound::Message(Message::Punch));
        }

        Ok(Self {
            shared,
            server_addr,
            local_addr,
            stream,
            events: events_rx,
            outbound: out_tx,
            cfg,
            sender_thread: Some(sender_thread),
            other_threads,
        })
    }

    /// The local endpoint both transports are bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// The server-assigned network id.
    pub fn network_id(&self) -> u32 {
        self.shared.network_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_alive()
    }

    fn send(&self, message: Message) -> Result<()> {
        if !self.shared.is_alive() {
            return Err(Error::Disconnected);
        }
        self.outbound
            .send(ClientOutbound::Message(message))
            .map_err(|_| Error::Disconnected)
    }

    /// Requests a login. The server answers with a `LoginResult` event,
    /// followed by the channel, user and source lists on success.
    pub fn login(
        &self,
        nickname: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        self.send(Message::Login {
            nickname: nickname.to_string(),
            username: username.map(str::to_string),
            password: password.map(str::to_string),
        })
    }

    pub fn request_channel_list(&self) -> Result<()> {
        self.send(Message::ChannelListRequest)
    }

    /// Moves this client to another channel.
    pub fn change_channel(&self, channel_id: u32) -> Result<()> {
        self.send(Message::ChannelChange {
            user_id: 0,
            channel_id,
        })
    }

    /// Moves another user to a channel (requires permission).
    pub fn move_user(&self, user_id: u32, channel_id: u32) -> Result<()> {
        self.send(Message::ChannelChange {
            user_id,
            channel_id,
        })
    }

    pub fn edit_channel(&self, action: ChannelEditAction, channel: ChannelInfo) -> Result<()> {
        self.send(Message::ChannelEdit { action, channel })
    }

    pub fn kick(&self, user_id: u32) -> Result<()> {
        self.send(Message::Kick { user_id })
    }

    /// Requests a new audio source; 0 asks for the server default bitrate.
    pub fn request_source(&self, bitrate: u32) -> Result<()> {
        self.send(Message::SourceRequest { bitrate })
    }

    /// Sends one encoded audio frame for a source this client owns.
    pub fn send_audio(&self, source_id: u32, frame: &[u8]) -> Result<()> {
        if frame.len() > MAX_AUDIO_FRAME_SIZE {
            return Err(Error::PayloadTooLarge(frame.len(), MAX_AUDIO_FRAME_SIZE));
        }
        self.send(Message::AudioData {
            source_id,
            frame: Arc::from(frame),
        })
    }

    fn pump(&mut self, internal: Internal) -> Option<ClientEvent> {
        match internal {
            Internal::Event(event) => Some(event),
            Internal::State(from, to) => {
                if let Some(ref mut cb) = self.cfg.on_state_change {
                    cb(from, to, &mut self.cfg.context);
                }
                None
            }
        }
    }

    /// Blocks until the next event. Returns `None` once the connection is
    /// gone and the queue is drained.
    pub fn recv(&mut self) -> Option<ClientEvent> {
        loop {
            let internal = self.events.recv().ok()?;
            if let Some(event) = self.pump(internal) {
                return Some(event);
            }
        }
    }

    /// Like [`recv`](Client::recv), giving up after `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<ClientEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let internal = self.events.recv_timeout(remaining).ok()?;
            if let Some(event) = self.pump(internal) {
                return Some(event);
            }
        }
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        loop {
            let internal = self.events.try_recv().ok()?;
            if let Some(event) = self.pump(internal) {
                return Some(event);
            }
        }
    }

    /// Gracefully disconnects: a notice is flushed to the server, then all
    /// background threads are joined.
    pub fn disconnect(mut self) {
        let _ = self.send(Message::Disconnect {
            reason: DisconnectReason::Requested,
        });
        let _ = self.outbound.send(ClientOutbound::Shutdown);
        if let Some(sender) = self.sender_thread.take() {
            let _ = sender.join();
        }
        self.shared.mark_dead();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        for thread in self.other_threads.drain(..) {
            let _ = thread.join();
        }
        log::info!("client disconnected");
    }
}

enum Inbound {
    Event(ClientEvent),
    Ignore,
    Violation,
}

fn classify(message: Message) -> Inbound {
    match message {
        Message::LoginResult { outcome, user_id } => {
            Inbound::Event(ClientEvent::LoginResult { outcome, user_id })
        }
        Message::ChannelList(channels) => Inbound::Event(ClientEvent::ChannelList(channels)),
        Message::UserList(users) => Inbound::Event(ClientEvent::UserList(users)),
        Message::SourceList(sources) => Inbound::Event(ClientEvent::SourceList(sources)),
        Message::UserLoggedIn(user) => Inbound::Event(ClientEvent::UserLoggedIn(user)),
        Message::UserDisconnected { user_id, reason } => {
            Inbound::Event(ClientEvent::UserDisconnected { user_id, reason })
        }
        Message::ChannelChangeResult {
            outcome,
            user_id,
            channel_id,
        } => Inbound::Event(ClientEvent::ChannelChangeResult {
            outcome,
            user_id,
            channel_id,
        }),
        Message::ChannelEditResult { outcome } => {
            Inbound::Event(ClientEvent::ChannelEditResult { outcome })
        }
        Message::KickResult { outcome, user_id } => {
            Inbound::Event(ClientEvent::KickResult { outcome, user_id })
        }
        Message::SourceResult { outcome, source } => {
            Inbound::Event(ClientEvent::SourceResult { outcome, source })
        }
        // Audio falls back to the stream while the handshake is pending.
        Message::AudioData { source_id, frame } => {
            Inbound::Event(ClientEvent::Audio { source_id, frame })
        }
        Message::Ping { .. } => Inbound::Ignore,
        Message::Connect { .. }
        | Message::Punch
        | Message::PunchReceived
        | Message::Bleeding
        | Message::Login { .. }
        | Message::Disconnect { .. }
        | Message::Kick { .. }
        | Message::ChannelListRequest
        | Message::ChannelEdit { .. }
        | Message::ChannelChange { .. }
        | Message::SourceRequest { .. } => Inbound::Violation,
    }
}

fn run_reader(
    mut reader: BufReader<TcpStream>,
    shared: Arc<ClientShared>,
    events: Sender<Internal>,
) {
    loop {
        match Message::read_stream(&mut reader) {
            Ok(Message::Disconnect { reason }) => {
                log::debug!("client received disconnect notice: {reason:?}");
                shared.fail(reason, &events);
                break;
            }
            Ok(message) => match classify(message) {
                Inbound::Event(event) => {
                    if events.send(Internal::Event(event)).is_err() {
                        break;
                    }
                }
                Inbound::Ignore => {}
                Inbound::Violation => {
                    log::debug!("client received a server-bound message, disconnecting");
                    shared.fail(DisconnectReason::ProtocolViolation, &events);
                    break;
                }
            },
            Err(err) => {
                if shared.is_alive() {
                    log::debug!("client read failed: {err}");
                }
                let reason = if err.is_protocol_violation() {
                    DisconnectReason::ProtocolViolation
                } else {
                    DisconnectReason::TransportError
                };
                shared.fail(reason, &events);
                break;
            }
        }
        if !shared.is_alive() {
            break;
        }
    }
}

fn run_udp(
    socket: UdpSocket,
    server_addr: SocketAddr,
    shared: Arc<ClientShared>,
    events: Sender<Internal>,
    out: Sender<ClientOutbound>,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    while shared.is_alive() {
        let (size, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e) if socket::is_timeout(e) => continue,
            Err(e) => {
                log::debug!("client datagram receive failed: {e}");
                continue;
            }
        };
        if addr != server_addr {
            continue;
        }
        let (network_id, message) = match Message::read_datagram(&buf[..size]) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::trace!("client ignored malformed datagram: {e}");
                continue;
            }
        };
        if network_id != shared.network_id() {
            log::trace!("client ignored datagram for connection {network_id}");
            continue;
        }
        match message {
            Message::PunchReceived => {
                if !shared.bleeding.swap(true, Ordering::AcqRel) {
                    log::debug!("punch acknowledged, confirming unreliable path");
                    // Bleeding itself rides the datagram path it confirms.
                    let _ = out.send(ClientOutbound::Message(Message::Bleeding));
                    shared.transition(ConnectionState::Bled, &events);
                }
            }
            Message::AudioData { source_id, frame } => {
                let _ = events.send(Internal::Event(ClientEvent::Audio { source_id, frame }));
            }
            Message::Ping { .. } => {}
            other => {
                log::trace!(
                    "client ignored {:#06x} on the unreliable path",
                    other.type_code()
                );
            }
        }
    }
}

fn run_sender(
    queue: Receiver<ClientOutbound>,
    stream: TcpStream,
    udp: UdpSocket,
    server_addr: SocketAddr,
    shared: Arc<ClientShared>,
    events: Sender<Internal>,
) {
    let mut dgram = Vec::with_capacity(MAX_DATAGRAM_SIZE);
    while let Ok(item) = queue.recv() {
        let message = match item {
            ClientOutbound::Shutdown => break,
            ClientOutbound::Message(message) => message,
        };
        // Punch-through and keep-alive traffic must ride the datagram path;
        // that path failing is degraded service, not a dead connection.
        if matches!(
            message,
            Message::Punch | Message::Bleeding | Message::Ping { .. }
        ) {
            if let Err(e) = datagram(&udp, server_addr, shared.network_id(), &message, &mut dgram) {
                log::debug!("keep-alive datagram failed: {e}");
            }
            continue;
        }
        let result = if message.is_reliable() || !shared.is_bleeding() {
            message.write_stream(&mut &stream)
        } else {
            match datagram(&udp, server_addr, shared.network_id(), &message, &mut dgram) {
                // Too big for a datagram; the stream has no such limit.
                Err(Error::PayloadTooLarge(..)) => message.write_stream(&mut &stream),
                other => other,
            }
        };
        if let Err(err) = result {
            if shared.is_alive() {
                log::debug!("client send failed: {err}");
            }
            shared.fail(DisconnectReason::TransportError, &events);
            break;
        }
    }
}

fn datagram(
    udp: &UdpSocket,
    addr: SocketAddr,
    network_id: u32,
    message: &Message,
    buf: &mut Vec<u8>,
) -> Result<()> {
    message.write_datagram(network_id, buf)?;
    udp.send_to(buf, addr)?;
    Ok(())
}

fn run_keepalive(out: Sender<ClientOutbound>, shared: Arc<ClientShared>, punch_through: bool) {
    let mut punch_attempts = 1u32; // the initial punch went out at connect
    let mut last_punch = Instant::now();
    let mut last_ping = Instant::now();
    while shared.is_alive() {
        thread::sleep(KEEPALIVE_TICK);
        if !shared.is_alive() {
            break;
        }
        if punch_through
            && !shared.is_bleeding()
            && punch_attempts < MAX_PUNCH_ATTEMPTS
            && last_punch.elapsed() >= PUNCH_INTERVAL
        {
            punch_attempts += 1;
            log::debug!("sending punch attempt {punch_attempts}");
            if out.send(ClientOutbound::Message(Message::Punch)).is_err() {
                break;
            }
            last_punch = Instant::now();
        }
        if last_ping.elapsed() >= PING_INTERVAL {
            let nonce = shared.ping_nonce.fetch_add(1, Ordering::AcqRel);
            if out
                .send(ClientOutbound::Message(Message::Ping { nonce }))
                .is_err()
            {
                break;
            }
            last_ping = Instant::now();
        }
    }
}
