//! TCP rendezvous for peer tunnels
//!
//! Peers connect to the signaling address and send the tunnel id as a `u64`
//! big-endian preamble; the connection is then handed to whichever listener
//! published that id. Unknown ids are dropped.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::route::RouteTable;
use crate::tcp::{TcpPacketConn, TcpPacketListener};
use crate::{PacketListener, Signaling, TransportError, TransportResult};

const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Inner {
    listener: TcpPacketListener,
    routes: RouteTable<u64>,
}

#[derive(Debug, Clone)]
pub struct TcpSignaling {
    inner: Arc<Inner>,
}

impl TcpSignaling {
    /// Bind the rendezvous address and start routing peers
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let listener = TcpPacketListener::bind(addr).await?;
        info!("Tunnel signaling listening on {}", listener.socket_addr());

        let inner = Arc::new(Inner {
            listener,
            routes: RouteTable::default(),
        });

        let accept_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match accept_inner.listener.accept_stream().await {
                    Ok(accepted) => accepted,
                    Err(TransportError::ListenerClosed) => break,
                    Err(e) => {
                        warn!("Signaling accept failed: {}", e);
                        continue;
                    }
                };
                let routes = accept_inner.routes.clone();
                tokio::spawn(async move {
                    if let Err(e) = route_peer(stream, routes).await {
                        debug!("Dropped signaling peer {}: {}", peer_addr, e);
                    }
                });
            }
            debug!("Signaling accept loop stopped");
        });

        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.listener.socket_addr()
    }

    /// Peer side: reach the listener published under `tunnel_id`
    pub async fn dial(addr: &str, tunnel_id: u64) -> TransportResult<TcpPacketConn> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_u64(tunnel_id).await?;
        TcpPacketConn::new(stream)
    }

    /// Stop accepting peers; the accept loop holds the listener until then
    pub async fn shutdown(&self) {
        self.inner.listener.close().await;
    }
}

async fn route_peer(mut stream: TcpStream, routes: RouteTable<u64>) -> TransportResult<()> {
    let tunnel_id = tokio::time::timeout(PREAMBLE_TIMEOUT, stream.read_u64())
        .await
        .map_err(|_| TransportError::Timeout)??;

    if !routes.contains(&tunnel_id) {
        return Err(TransportError::SignalingError(format!(
            "unknown tunnel {}",
            tunnel_id
        )));
    }

    debug!("Routing peer to tunnel {}", tunnel_id);
    let conn = TcpPacketConn::new(stream)?;
    routes.route(&tunnel_id, Box::new(conn)).await
}

#[async_trait]
impl Signaling for TcpSignaling {
    async fn publish(&self, tunnel_id: u64, token: &str) -> TransportResult<Box<dyn PacketListener>> {
        if token.is_empty() {
            return Err(TransportError::SignalingError(
                "missing rendezvous token".to_string(),
            ));
        }
        let listener = self.inner.routes.register(tunnel_id)?;
        debug!("Published tunnel {}", tunnel_id);
        Ok(Box::new(listener))
    }
}
