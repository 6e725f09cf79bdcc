//! In-process transports
//!
//! Connected pairs backed by channels, an address registry that acts as both
//! listener factory and [`Dialer`], and a signaling hub keyed by tunnel id.
//! Used by tests and by embedders that run both ends in one process.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::route::{RouteTable, RoutedListener};
use crate::{Dialer, PacketConn, PacketListener, Signaling, TransportError, TransportResult};

/// Listener half of [`MemoryNetwork`]
pub type MemoryListener = RoutedListener<String>;

/// One end of an in-memory connection
///
/// Both ends share the closed state: closing either side closes the pair.
/// Frames already queued are still delivered before a read reports closure.
pub struct MemoryConn {
    connection_id: String,
    remote_addr: String,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for MemoryConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConn")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MemoryConn {
    /// Connected pair; `a_addr` is how `b` sees `a` and vice versa
    pub fn pair(a_addr: impl Into<String>, b_addr: impl Into<String>) -> (MemoryConn, MemoryConn) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let a = MemoryConn {
            connection_id: format!("mem-{}", uuid::Uuid::new_v4()),
            remote_addr: b_addr.into(),
            tx: a_tx,
            rx: Mutex::new(a_rx),
            closed: closed.clone(),
            cancel: cancel.clone(),
        };
        let b = MemoryConn {
            connection_id: format!("mem-{}", uuid::Uuid::new_v4()),
            remote_addr: a_addr.into(),
            tx: b_tx,
            rx: Mutex::new(b_rx),
            closed,
            cancel,
        };
        (a, b)
    }
}

#[async_trait]
impl PacketConn for MemoryConn {
    async fn read_packet(&self) -> TransportResult<Bytes> {
        let mut rx = self.rx.lock().await;
        if let Ok(frame) = rx.try_recv() {
            return Ok(frame);
        }
        tokio::select! {
            biased;
            frame = rx.recv() => frame.ok_or(TransportError::ConnectionClosed),
            _ = self.cancel.cancelled() => Err(TransportError::ConnectionClosed),
        }
    }

    async fn write_packet(&self, data: &[u8]) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

/// Address registry for in-memory listeners
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    routes: RouteTable<String>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, address: impl Into<String>) -> TransportResult<MemoryListener> {
        self.routes.register(address.into())
    }
}

#[async_trait]
impl Dialer for MemoryNetwork {
    async fn dial(&self, address: &str) -> TransportResult<Box<dyn PacketConn>> {
        let key = address.to_string();
        if !self.routes.contains(&key) {
            return Err(TransportError::ConnectionError(format!(
                "connection refused: {}",
                address
            )));
        }
        let client_addr = format!("memory-client-{}", uuid::Uuid::new_v4());
        let (client, server) = MemoryConn::pair(client_addr, address);
        self.routes.route(&key, Box::new(server)).await?;
        Ok(Box::new(client))
    }
}

/// In-process signaling hub
#[derive(Debug, Clone, Default)]
pub struct MemorySignaling {
    routes: RouteTable<u64>,
    published: Arc<StdMutex<Vec<(u64, String)>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer side: reach the listener published under `tunnel_id`
    pub async fn dial(&self, tunnel_id: u64) -> TransportResult<MemoryConn> {
        if !self.routes.contains(&tunnel_id) {
            return Err(TransportError::SignalingError(format!(
                "unknown tunnel {}",
                tunnel_id
            )));
        }
        let (peer, relay) = MemoryConn::pair(
            format!("peer@tunnel-{}", tunnel_id),
            format!("tunnel-{}", tunnel_id),
        );
        self.routes.route(&tunnel_id, Box::new(relay)).await?;
        Ok(peer)
    }

    /// Tunnel ids and tokens passed to `publish`, in order
    pub fn published(&self) -> Vec<(u64, String)> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    pub fn is_published(&self, tunnel_id: u64) -> bool {
        self.routes.contains(&tunnel_id)
    }

    /// Make subsequent publishes fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn publish(&self, tunnel_id: u64, token: &str) -> TransportResult<Box<dyn PacketListener>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::SignalingError(
                "signaling unavailable".to_string(),
            ));
        }
        let listener = self.routes.register(tunnel_id)?;
        if let Ok(mut published) = self.published.lock() {
            published.push((tunnel_id, token.to_string()));
        }
        Ok(Box::new(listener))
    }
}
