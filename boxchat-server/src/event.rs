//! Connection handles and the events producers hand to the authority.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::config::IdentityMode;

/// Process-unique id of one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client identity, derived from the remote endpoint.
///
/// This is the key of the client table and the ban set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn from_peer(peer: SocketAddr, mode: IdentityMode) -> Self {
        match mode {
            IdentityMode::Endpoint => Self(peer.to_string()),
            IdentityMode::Host => Self(peer.ip().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cloneable handle to one live connection.
///
/// Writes never block: text goes onto a bounded per-connection queue that
/// the connection's writer task drains. A full or dead queue drops the
/// text. The reader side notices a dead peer on its own and reports
/// `Disconnected`, which is what eventually cleans the client up.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    address: Address,
    peer: SocketAddr,
    tx: mpsc::Sender<String>,
    close: Arc<watch::Sender<bool>>,
}

/// Receiving side of a [`ClientHandle`], owned by the writer task.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<String>,
    close: watch::Receiver<bool>,
}

impl ClientHandle {
    /// Create a handle for a freshly accepted peer, plus the outbox its
    /// writer task will drain.
    pub fn new(peer: SocketAddr, mode: IdentityMode, capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = watch::channel(false);
        let handle = Self {
            id: ConnectionId::next(),
            address: Address::from_peer(peer, mode),
            peer,
            tx,
            close: Arc::new(close_tx),
        };
        (handle, Outbox { rx, close: close_rx })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue text for the client. Returns whether it was queued; callers
    /// are free to ignore the result.
    pub fn write(&self, text: impl Into<String>) -> bool {
        match self.tx.try_send(text.into()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(address = %self.address, conn_id = %self.id, "Dropped outbound write: {e}");
                false
            }
        }
    }

    /// Ask the writer to flush what is queued and shut the socket down.
    /// Idempotent.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    /// Resolves once a close was requested or the writer side is gone.
    pub async fn closed(&self) {
        let mut close_rx = self.close.subscribe();
        tokio::select! {
            _ = close_requested(&mut close_rx) => {}
            _ = self.tx.closed() => {}
        }
    }
}

impl Outbox {
    /// Next queued text if one is ready.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Everything currently queued.
    pub fn drain(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn close_requested(&self) -> bool {
        *self.close.borrow()
    }

    /// Resolves `grace` after the authority asked for the connection to
    /// close.
    pub async fn close_expired(&mut self, grace: Duration) {
        close_requested(&mut self.close).await;
        tokio::time::sleep(grace).await;
    }

    /// Wait for the next thing the writer has to do. Queued text always
    /// comes out before a pending close.
    pub async fn next(&mut self) -> Outgoing {
        tokio::select! {
            biased;
            text = self.rx.recv() => match text {
                Some(text) => Outgoing::Text(text),
                None => Outgoing::Done,
            },
            _ = close_requested(&mut self.close) => Outgoing::Close,
        }
    }
}

/// Next step for a connection's writer.
#[derive(Debug, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    /// The authority closed the connection.
    Close,
    /// Every handle is gone.
    Done,
}

async fn close_requested(rx: &mut watch::Receiver<bool>) {
    // Err means every sender is gone, which only happens with no handles
    // left; treat that as closed too.
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Work item handed from producers to the authority.
#[derive(Debug)]
pub enum Event {
    Connected(ClientHandle),
    Disconnected(ClientHandle),
    NewMessage { handle: ClientHandle, text: String },
}

impl Event {
    pub fn handle(&self) -> &ClientHandle {
        match self {
            Event::Connected(handle)
            | Event::Disconnected(handle)
            | Event::NewMessage { handle, .. } => handle,
        }
    }
}
