//! Peer tunnel lifecycle
//!
//! At most one tunnel is published at a time. It accepts exactly one peer:
//! as soon as that peer arrives the listener is closed and the current id is
//! cleared, so the next handoff publishes a fresh id.

use netherlink_transport::{HeaderedConn, PacketConn, PacketListener, Signaling, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::session::{Session, SessionError};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to get rendezvous token: {0}")]
    Session(#[from] SessionError),

    #[error("Failed to publish tunnel: {0}")]
    Transport(#[from] TransportError),
}

/// Source of candidate tunnel ids; zero is never used
pub type TunnelIdSource = Box<dyn Fn() -> u64 + Send + Sync>;

/// A peer that arrived on a published tunnel
#[derive(Debug)]
pub struct AcceptedPeer {
    pub tunnel_id: u64,
    /// Already wrapped so reads carry the batch header
    pub conn: Box<dyn PacketConn>,
}

pub struct TunnelManager {
    signaling: Arc<dyn Signaling>,
    session: Arc<dyn Session>,
    next_id: TunnelIdSource,
    current: Arc<AtomicU64>,
    open_lock: Mutex<()>,
    listener: Arc<StdMutex<Option<Arc<dyn PacketListener>>>>,
    peers: mpsc::UnboundedSender<AcceptedPeer>,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("current", &self.current_id())
            .finish()
    }
}

impl TunnelManager {
    /// Accepted peers are delivered on the returned channel
    pub fn new(
        signaling: Arc<dyn Signaling>,
        session: Arc<dyn Session>,
    ) -> (Self, mpsc::UnboundedReceiver<AcceptedPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let manager = Self {
            signaling,
            session,
            next_id: Box::new(rand::random::<u64>),
            current: Arc::new(AtomicU64::new(0)),
            open_lock: Mutex::new(()),
            listener: Arc::new(StdMutex::new(None)),
            peers,
        };
        (manager, rx)
    }

    pub fn with_id_source(mut self, source: TunnelIdSource) -> Self {
        self.next_id = source;
        self
    }

    /// Id of the published tunnel, or 0 when none is open
    pub fn current_id(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Return the open tunnel's id, publishing a new tunnel if needed
    pub async fn ensure_open(&self) -> Result<u64, TunnelError> {
        let _guard = self.open_lock.lock().await;

        let current = self.current_id();
        if current != 0 {
            debug!("Reusing tunnel {}", current);
            return Ok(current);
        }

        let tunnel_id = loop {
            let id = (self.next_id)();
            if id != 0 {
                break id;
            }
        };

        let token = self.session.rendezvous_token().await?;
        let listener: Arc<dyn PacketListener> =
            Arc::from(self.signaling.publish(tunnel_id, &token).await?);

        self.current.store(tunnel_id, Ordering::SeqCst);
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener.clone());
        }
        info!("Published tunnel {}", tunnel_id);

        let current = self.current.clone();
        let slot = self.listener.clone();
        let peers = self.peers.clone();
        tokio::spawn(async move {
            let accepted = listener.accept().await;
            listener.close().await;
            let _ = current.compare_exchange(tunnel_id, 0, Ordering::SeqCst, Ordering::SeqCst);
            if let Ok(mut slot) = slot.lock() {
                if slot.as_ref().is_some_and(|l| Arc::ptr_eq(l, &listener)) {
                    *slot = None;
                }
            }

            match accepted {
                Ok(conn) => {
                    info!("Peer connected on tunnel {} from {}", tunnel_id, conn.remote_addr());
                    let peer = AcceptedPeer {
                        tunnel_id,
                        conn: Box::new(HeaderedConn::new(conn)),
                    };
                    if peers.send(peer).is_err() {
                        warn!("Relay engine gone, dropping peer on tunnel {}", tunnel_id);
                    }
                }
                Err(e) if e.is_closed() => debug!("Tunnel {} closed", tunnel_id),
                Err(e) => warn!("Tunnel {} accept failed: {}", tunnel_id, e),
            }
        });

        Ok(tunnel_id)
    }

    /// Withdraw the published tunnel, if any
    pub async fn close(&self) {
        let listener = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if let Some(listener) = listener {
            listener.close().await;
        }
        self.current.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::UnsignedSession;
    use netherlink_proto::IdentityData;
    use netherlink_transport::MemorySignaling;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    fn manager(ids: Vec<u64>) -> (TunnelManager, mpsc::UnboundedReceiver<AcceptedPeer>, MemorySignaling) {
        let signaling = MemorySignaling::new();
        let session = UnsignedSession::new(IdentityData::default());
        let (manager, rx) = TunnelManager::new(Arc::new(signaling.clone()), Arc::new(session));
        let next = AtomicU64::new(0);
        let manager = manager.with_id_source(Box::new(move || {
            let i = next.fetch_add(1, Ordering::SeqCst) as usize;
            ids[i.min(ids.len() - 1)]
        }));
        (manager, rx, signaling)
    }

    #[tokio::test]
    async fn test_reuses_open_tunnel() {
        let (manager, _rx, signaling) = manager(vec![1234, 5678]);
        assert_eq!(manager.ensure_open().await.unwrap(), 1234);
        assert_eq!(manager.ensure_open().await.unwrap(), 1234);
        assert_eq!(signaling.published().len(), 1);
    }

    #[tokio::test]
    async fn test_skips_zero_id() {
        let (manager, _rx, _) = manager(vec![0, 0, 42]);
        assert_eq!(manager.ensure_open().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_first_peer_closes_tunnel() {
        let (manager, mut rx, signaling) = manager(vec![1234, 5678]);
        manager.ensure_open().await.unwrap();

        let peer = signaling.dial(1234).await.unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.tunnel_id, 1234);
        assert_eq!(manager.current_id(), 0);

        // Second dial on the same id is refused
        assert!(signaling.dial(1234).await.is_err());

        // Reads through the tunnel get the batch header back
        peer.write_packet(&[0x00, 0x01]).await.unwrap();
        let frame = accepted.conn.read_packet().await.unwrap();
        assert_eq!(&frame[..], &[0xfe, 0x00, 0x01]);

        assert_eq!(manager.ensure_open().await.unwrap(), 5678);
    }

    #[tokio::test]
    async fn test_signaling_failure_leaves_no_tunnel() {
        let (manager, _rx, signaling) = manager(vec![7]);
        signaling.set_unavailable(true);
        assert!(matches!(
            manager.ensure_open().await,
            Err(TunnelError::Transport(_))
        ));
        assert_eq!(manager.current_id(), 0);
    }

    #[tokio::test]
    async fn test_close_withdraws_tunnel() {
        let (manager, _rx, signaling) = manager(vec![9]);
        manager.ensure_open().await.unwrap();
        manager.close().await;
        assert_eq!(manager.current_id(), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!signaling.is_published(9));
    }
}
