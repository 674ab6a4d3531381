use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::connection::{ConnectionTable, RemoteClient};
use crate::consts::MAX_DATAGRAM_SIZE;
use crate::dispatch::{Outbound, OutboundSink, SessionEvent};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::providers::{
    ChannelProvider, GuestPermissionProvider, GuestUserProvider, MemoryChannelProvider,
    PermissionProvider, UserProvider,
};
use crate::session::{self, SessionState};
use crate::socket;
use crate::types::DisconnectReason;

/// Configuration for a server: the pluggable user, channel and permission
/// backends. The default admits guests, keeps channels in memory and grants
/// the guest permission set.
///
/// # Example
/// ```no_run
/// use voicelink::{Server, ServerConfig, GuestUserProvider};
///
/// let cfg = ServerConfig::new().user_provider(GuestUserProvider::new());
/// let server = Server::start("127.0.0.1:4242".parse().unwrap(), cfg).unwrap();
/// println!("listening on {}", server.local_addr());
/// ```
pub struct ServerConfig {
    user_provider: Box<dyn UserProvider>,
    channel_provider: Box<dyn ChannelProvider>,
    permission_provider: Box<dyn PermissionProvider>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            user_provider: Box::new(GuestUserProvider::new()),
            channel_provider: Box::new(MemoryChannelProvider::new()),
            permission_provider: Box::new(GuestPermissionProvider),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn user_provider(mut self, provider: impl UserProvider + 'static) -> Self {
        self.user_provider = Box::new(provider);
        self
    }
    pub fn channel_provider(mut self, provider: impl ChannelProvider + 'static) -> Self {
        self.channel_provider = Box::new(provider);
        self
    }
    pub fn permission_provider(mut self, provider: impl PermissionProvider + 'static) -> Self {
        self.permission_provider = Box::new(provider);
        self
    }
}

/// The `voicelink` server.
///
/// Owns the listening stream socket and the shared datagram socket (bound
/// to the same port), accepts connections, assigns network ids, runs the
/// NAT punch-through handshake, and funnels every inbound message into the
/// single-writer session dispatcher.
pub struct Server {
    local_addr: SocketAddr,
    connections: Arc<ConnectionTable>,
    sink: OutboundSink,
    events: Sender<SessionEvent>,
    outbound: Sender<Outbound>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// Binds both sockets and spawns the server's threads: accept,
    /// unreliable receive, outgoing sender and the session dispatcher.
    pub fn start(addr: SocketAddr, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let udp = socket::bind_udp(local_addr)?;

        let connections = Arc::new(ConnectionTable::new());
        let (events_tx, events_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        let sink = OutboundSink::new(out_tx.clone(), events_tx.clone(), connections.clone());
        let shutdown = Arc::new(AtomicBool::new(false));
        let state = SessionState::new(
            connections.clone(),
            sink.clone(),
            config.user_provider,
            config.channel_provider,
            config.permission_provider,
        );

        let mut threads = Vec::new();
        threads.push(
            thread::Builder::new()
                .name("vl-dispatch".to_string())
                .spawn(move || session::run(events_rx, state))?,
        );
        {
            let udp = udp.try_clone()?;
            let events = events_tx.clone();
            threads.push(
                thread::Builder::new()
                    .name("vl-send".to_string())
                    .spawn(move || run_sender(out_rx, udp, events))?,
            );
        }
        {
            let connections = connections.clone();
            let events = events_tx.clone();
            let sink = sink.clone();
            let shutdown = shutdown.clone();
            threads.push(
                thread::Builder::new()
                    .name("vl-udp".to_string())
                    .spawn(move || run_udp(udp, connections, events, sink, shutdown))?,
            );
        }
        {
            let connections = connections.clone();
            let events = events_tx.clone();
            let sink = sink.clone();
            let shutdown = shutdown.clone();
            threads.push(
                thread::Builder::new()
                    .name("vl-accept".to_string())
                    .spawn(move || run_accept(listener, connections, events, sink, shutdown))?,
            );
        }
        log::info!("server listening on {local_addr}");
        Ok(Self {
            local_addr,
            connections,
            sink,
            events: events_tx,
            outbound: out_tx,
            shutdown,
            threads,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live connections, logged in or not.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Tells the dispatcher the channel backend changed externally. Users
    /// left in vanished channels move to the default channel.
    pub fn notify_channels_changed(&self) {
        let _ = self.events.send(SessionEvent::ChannelsChanged);
    }

    /// Invalidates cached permissions for one user, or for everyone.
    pub fn notify_permissions_changed(&self, user_id: Option<u32>) {
        let _ = self.events.send(SessionEvent::PermissionsChanged { user_id });
    }

    /// Notifies every client, closes every connection and joins all server
    /// threads.
    pub fn shutdown(mut self) {
        log::info!("server shutting down");
        for client in self.connections.snapshot() {
            self.sink.send(
                &client,
                Message::Disconnect {
                    reason: DisconnectReason::ServerShutdown,
                },
            );
            self.sink.close(client);
        }
        self.shutdown.store(true, Ordering::Release);
        let _ = self.outbound.send(Outbound::Shutdown);
        let _ = self.events.send(SessionEvent::Shutdown);
        // The accept loop is parked in accept(); poke it awake.
        let _ = TcpStream::connect(self.local_addr);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        log::info!("server stopped");
    }
}

fn run_accept(
    listener: TcpListener,
    connections: Arc<ConnectionTable>,
    events: Sender<SessionEvent>,
    sink: OutboundSink,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                log::error!("accept failed: {e}");
                continue;
            }
        };
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = accept_one(stream, peer, &connections, &events, &sink) {
            log::error!("failed to set up connection from {peer}: {e}");
        }
    }
    log::debug!("accept loop stopped");
}

fn accept_one(
    stream: TcpStream,
    peer: SocketAddr,
    connections: &Arc<ConnectionTable>,
    events: &Sender<SessionEvent>,
    sink: &OutboundSink,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let id = connections.allocate_id()?;
    let reader = stream.try_clone()?;
    let client = Arc::new(RemoteClient::new(id, peer, stream));
    connections.insert(client.clone());
    log::info!("accepted connection {id} from {peer}");
    // The id assignment is the first frame the client sees.
    sink.send(&client, Message::Connect { network_id: id });
    let _ = events.send(SessionEvent::Connected(id));
    let events = events.clone();
    thread::Builder::new()
        .name(format!("vl-read-{id}"))
        .spawn(move || run_reader(id, reader, client, events))?;
    Ok(())
}

/// One blocking reader per connection: sanity byte, type code, payload,
/// enqueue, repeat. Any failure ends the connection.
fn run_reader(
    id: u32,
    stream: TcpStream,
    client: Arc<RemoteClient>,
    events: Sender<SessionEvent>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        match Message::read_stream(&mut reader) {
            Ok(message) => {
                if events
                    .send(SessionEvent::Message {
                        connection: id,
                        message,
                    })
                    .is_err()
                {
                    break;
                }
                if !client.is_alive() {
                    break;
                }
            }
            Err(err) => {
                let reason = if err.is_protocol_violation() {
                    DisconnectReason::ProtocolViolation
                } else {
                    DisconnectReason::TransportError
                };
                if client.mark_dead() {
                    log::debug!("connection {id} read failed: {err}");
                    let _ = events.send(SessionEvent::Disconnected {
                        connection: id,
                        reason,
                    });
                }
                break;
            }
        }
    }
}

/// The shared unreliable receive loop. Transport-level punch-through is
/// answered here; session traffic is enqueued for the dispatcher. Errors
/// are per-datagram and never tear the loop down.
fn run_udp(
    socket: UdpSocket,
    connections: Arc<ConnectionTable>,
    events: Sender<SessionEvent>,
    sink: OutboundSink,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    while !shutdown.load(Ordering::Acquire) {
        let (size, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e) if socket::is_timeout(e) => continue,
            Err(e) => {
                log::error!("datagram receive failed: {e}");
                continue;
            }
        };
        let (network_id, message) = match Message::read_datagram(&buf[..size]) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::trace!("ignored malformed datagram from {addr}: {e}");
                continue;
            }
        };
        let Some(client) = connections.get(network_id) else {
            // Forged or stale ids must not be able to disturb a session;
            // only connectionless-accepted types survive the miss.
            if message.accepts_connectionless() {
                let _ = events.send(SessionEvent::Connectionless {
                    from: addr,
                    message,
                });
            } else {
                log::trace!("dropped datagram for unknown connection {network_id} from {addr}");
            }
            continue;
        };
        match message {
            Message::Punch => {
                log::debug!("punch from connection {network_id} at {addr}");
                sink.send_datagram(addr, network_id, Message::PunchReceived);
            }
            Message::Bleeding => {
                if !client.is_bleeding() {
                    log::debug!("connection {network_id} bled, datagram path {addr} confirmed");
                    client.bleed(addr);
                }
            }
            message => {
                let _ = events.send(SessionEvent::Message {
                    connection: network_id,
                    message,
                });
            }
        }
    }
    log::debug!("unreliable receive loop stopped");
}

/// The single outgoing drain loop. Parks on the queue; the send is the
/// wake signal. Write failures mark the connection disconnected and are
/// not retried.
fn run_sender(queue: Receiver<Outbound>, udp: UdpSocket, events: Sender<SessionEvent>) {
    let mut dgram = Vec::with_capacity(MAX_DATAGRAM_SIZE);
    while let Ok(item) = queue.recv() {
        match item {
            Outbound::Shutdown => break,
            Outbound::ToClient { client, message } => {
                client.dequeue();
                if let Err(err) = deliver(&client, &message, &udp, &mut dgram) {
                    if client.mark_dead() {
                        log::debug!("write to connection {} failed: {err}", client.id);
                        let _ = events.send(SessionEvent::Disconnected {
                            connection: client.id,
                            reason: DisconnectReason::TransportError,
                        });
                    }
                }
            }
            Outbound::Datagram {
                addr,
                network_id,
                message,
            } => {
                if let Err(err) = datagram(&udp, addr, network_id, &message, &mut dgram) {
                    log::debug!("datagram to {addr} failed: {err}");
                }
            }
            Outbound::Close { client } => client.shutdown(),
        }
    }
    log::debug!("outgoing sender stopped");
}

fn deliver(
    client: &RemoteClient,
    message: &Message,
    udp: &UdpSocket,
    dgram: &mut Vec<u8>,
) -> Result<()> {
    if message.is_reliable() || !client.is_bleeding() {
        // Correctness over latency while the punch-through is pending.
        return client.write_frame(message);
    }
    match client.udp_addr() {
        Some(addr) => match datagram(udp, addr, client.id, message, dgram) {
            // Too big for a datagram; the stream has no such limit.
            Err(Error::PayloadTooLarge(..)) => client.write_frame(message),
            other => other,
        },
        None => client.write_frame(message),
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
