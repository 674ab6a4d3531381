use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::message::Message;

/// The lifecycle of one logical connection.
///
/// `Established` and `Bled` both carry command and audio traffic; the only
/// behavioral difference is the transport used for unreliable-marked sends.
/// A connection whose punch-through never completes stays `Established`
/// and keeps delivering everything over the reliable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reliable stream is being set up.
    Connecting,
    /// Waiting for the server-assigned network id.
    Handshaking,
    /// Live, unreliable path unconfirmed.
    Established,
    /// Live, unreliable path confirmed by the punch-through round trip.
    Bled,
    /// Terminal.
    Disconnected,
}

/// Server-side handle for one live connection.
///
/// Shared between the reader thread, the unreliable receive loop, the
/// outgoing sender and the dispatcher. Only the sender writes to the
/// stream; everyone else flips flags or enqueues.
pub(crate) struct RemoteClient {
    pub id: u32,
    pub addr: SocketAddr,
    stream: TcpStream,
    udp_addr: Mutex<Option<SocketAddr>>,
    bleeding: AtomicBool,
    alive: AtomicBool,
    queued: AtomicUsize,
}

impl RemoteClient {
    pub fn new(id: u32, addr: SocketAddr, stream: TcpStream) -> Self {
        Self {
            id,
            addr,
            stream,
            udp_addr: Mutex::new(None),
            bleeding: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Flags the connection dead. Returns true only for the caller that
    /// performed the transition, so the disconnect event fires once.
    pub fn mark_dead(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Records the confirmed datagram path after the punch-through round
    /// trip completes.
    pub fn bleed(&self, addr: SocketAddr) {
        *self.udp_addr.lock().unwrap() = Some(addr);
        self.bleeding.store(true, Ordering::Release);
    }

    pub fn is_bleeding(&self) -> bool {
        self.bleeding.load(Ordering::Acquire)
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.lock().unwrap()
    }

    pub fn state(&self) -> ConnectionState {
        if !self.is_alive() {
            ConnectionState::Disconnected
        } else if self.is_bleeding() {
            ConnectionState::Bled
        } else {
            ConnectionState::Established
        }
    }

    /// Writes one frame to the reliable stream. Only the outgoing sender
    /// loop calls this, so frames never interleave.
    pub fn write_frame(&self, message: &Message) -> Result<()> {
        message.write_stream(&mut &self.stream)
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn enqueue(&self) -> usize {
        self.queued.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dequeue(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// All live connections, keyed by network id.
///
/// Ids are handed out from a monotonically increasing counter and retired
/// on disconnect, never reused, so a stale datagram can at worst reference
/// a missing entry.
pub(crate) struct ConnectionTable {
    inner: Mutex<HashMap<u32, Arc<RemoteClient>>>,
    next_id: AtomicU32,
    exhausted: AtomicBool,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            exhausted: AtomicBool::new(false),
        }
    }

    pub fn allocate_id(&self) -> Result<u32> {
        if self.exhausted.load(Ordering::Acquire) {
            return Err(Error::NetworkIdsExhausted);
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        if id == u32::MAX {
            self.exhausted.store(true, Ordering::Release);
            return Err(Error::NetworkIdsExhausted);
        }
        Ok(id)
    }

    pub fn insert(&self, client: Arc<RemoteClient>) {
        self.inner.lock().unwrap().insert(client.id, client);
    }

    pub fn get(&self, id: u32) -> Option<Arc<RemoteClient>> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: u32) -> Option<Arc<RemoteClient>> {
        self.inner.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Snapshot of the live connections, for broadcasts and shutdown.
    pub fn snapshot(&self) -> Vec<Arc<RemoteClient>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }
}
