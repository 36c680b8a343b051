//! Registry of active client connections.
//!
//! The registry is the only state shared across connection handlers. It is
//! guarded by a single mutex, and that mutex is never held across I/O:
//! broadcasting code takes a [`ClientRegistry::snapshot`] first and performs
//! its sends against the copy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;

/// Unique identifier for one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientId(u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Handle to one accepted connection, used both for addressing it in the
/// registry and for writing to it.
///
/// The write half is shared: the owning handler uses it for echo, while
/// other handlers clone it out of a snapshot for broadcast. Identifier-based
/// removal plus `Arc` ownership means a concurrent disconnect can never
/// redirect an in-flight send to an unrelated connection; at worst the send
/// fails on a closed socket.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    addr: SocketAddr,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
}

impl ClientHandle {
    pub fn new(id: ClientId, addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            addr,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Write the payload verbatim to this connection.
    ///
    /// Serializes with other senders targeting the same connection, so
    /// interleaved broadcasts never corrupt each other's chunks.
    pub async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await
    }
}

/// Collection of all currently connected clients.
///
/// A handle is present exactly while its connection handler is actively
/// reading: inserted right after accept, removed once the read loop ends.
pub struct ClientRegistry {
    clients: Mutex<Vec<ClientHandle>>,
    next_id: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next connection identifier
    pub fn next_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert a handle; visible to all subsequent snapshots
    pub fn add(&self, handle: ClientHandle) {
        let mut clients = self.clients.lock().expect("registry lock poisoned");
        clients.push(handle);
    }

    /// Remove the handle with the given identifier.
    ///
    /// Removal is by identifier, never by position, and is a no-op when the
    /// handle is already gone. Returns whether an entry was removed.
    pub fn remove(&self, id: ClientId) -> bool {
        let mut clients = self.clients.lock().expect("registry lock poisoned");
        let before = clients.len();
        clients.retain(|client| client.id != id);
        clients.len() != before
    }

    /// Point-in-time copy of the current membership, in insertion order.
    ///
    /// Callers iterate the copy with the registry lock released, so sends
    /// that block on a slow peer never stall unrelated `add`/`remove` calls.
    pub fn snapshot(&self) -> Vec<ClientHandle> {
        let clients = self.clients.lock().expect("registry lock poisoned");
        clients.clone()
    }

    /// Number of currently registered clients
    pub fn len(&self) -> usize {
        self.clients.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
