use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::connection::{ConnectionTable, RemoteClient};
use crate::consts::MAX_OUTBOUND_QUEUE;
use crate::message::Message;
use crate::types::DisconnectReason;

/// Everything the single dispatcher consumer processes, in strict arrival
/// order. Receive callbacks and provider notifications only enqueue; the
/// dispatcher thread is the sole writer of session state.
pub(crate) enum SessionEvent {
    /// A reliable session was accepted and assigned a network id.
    Connected(u32),
    /// A message arrived from an established connection, on either plane.
    Message { connection: u32, message: Message },
    /// A connectionless-accepted message from an endpoint with no session.
    Connectionless { from: SocketAddr, message: Message },
    /// The connection died: transport failure, protocol violation, graceful
    /// close, or queue overflow. Processing is idempotent.
    Disconnected {
        connection: u32,
        reason: DisconnectReason,
    },
    /// The channel backend changed underneath us.
    ChannelsChanged,
    /// The permission backend changed; `None` invalidates every cached user.
    PermissionsChanged { user_id: Option<u32> },
    Shutdown,
}

/// Work for the outgoing drain loop. Targets carry the connection handle so
/// the sender never takes the table lock.
pub(crate) enum Outbound {
    /// Deliver on the connection's current best transport: the stream for
    /// reliable messages and un-bled connections, the datagram path
    /// otherwise.
    ToClient {
        client: Arc<RemoteClient>,
        message: Message,
    },
    /// Raw datagram to an endpoint, with the network id to stamp on the
    /// frame (0 for connectionless replies).
    Datagram {
        addr: SocketAddr,
        network_id: u32,
        message: Message,
    },
    /// Close the stream once everything queued before this has been
    /// written, so disconnect notices still reach the peer.
    Close { client: Arc<RemoteClient> },
    Shutdown,
}

/// Producer handle for the outgoing queue.
///
/// Enqueueing never blocks beyond the channel lock. Per-connection depth is
/// bounded: a connection that cannot drain [`MAX_OUTBOUND_QUEUE`] messages
/// is disconnected rather than letting the queue grow without limit.
#[derive(Clone)]
pub(crate) struct OutboundSink {
    tx: Sender<Outbound>,
    events: Sender<SessionEvent>,
    connections: Arc<ConnectionTable>,
}

impl OutboundSink {
    pub fn new(
        tx: Sender<Outbound>,
        events: Sender<SessionEvent>,
        connections: Arc<ConnectionTable>,
    ) -> Self {
        Self {
            tx,
            events,
            connections,
        }
    }

    pub fn send(&self, client: &Arc<RemoteClient>, message: Message) {
        if !client.is_alive() {
            return;
        }
        let depth = client.enqueue();
        if depth > MAX_OUTBOUND_QUEUE {
            log::warn!(
                "connection {} overflowed its outbound queue ({depth} queued), disconnecting",
                client.id
            );
            if client.mark_dead() {
                let _ = self.events.send(SessionEvent::Disconnected {
                    connection: client.id,
                    reason: DisconnectReason::Congestion,
                });
            }
            return;
        }
        let _ = self.tx.send(Outbound::ToClient {
            client: client.clone(),
            message,
        });
    }

    pub fn send_to(&self, connection: u32, message: Message) {
        if let Some(client) = self.connections.get(connection) {
            self.send(&client, message);
        }
    }

    pub fn send_datagram(&self, addr: SocketAddr, network_id: u32, message: Message) {
        let _ = self.tx.send(Outbound::Datagram {
            addr,
            network_id,
            message,
        });
    }

    pub fn close(&self, client: Arc<RemoteClient>) {
        let _ = self.tx.send(Outbound::Close { client });
    }
}
