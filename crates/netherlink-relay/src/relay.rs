//! Relay engine
//!
//! Takes peers arriving through the tunnel, logs them in, opens the upstream
//! connection as the session's account and pumps batches both ways. When the
//! upstream server sends a Transfer the engine keeps the client out of the
//! real destination: it picks the new target itself, opens a fresh tunnel
//! and transfers the client there instead.

use bytes::Bytes;
use netherlink_proto::packets::Packet;
use netherlink_proto::{inspect, Inspected, PacketData, Transfer};
use netherlink_transport::Dialer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::conn::{ConnError, LoginError, ProxyConnection};
use crate::path_selector::PathSelector;
use crate::session::Session;
use crate::tunnel::{AcceptedPeer, TunnelError, TunnelManager};
use crate::UpstreamTarget;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Login(#[from] LoginError),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Failed to connect to {address}: {reason}")]
    Upstream { address: String, reason: String },

    #[error("Account mismatch")]
    AccountMismatch,

    #[error("No server selected")]
    NoTarget,

    #[error("Login timed out")]
    Timeout,
}

/// Shared, replaceable upstream target
pub type TargetSlot = Arc<RwLock<Option<UpstreamTarget>>>;

#[derive(Debug)]
pub struct RelayEngine {
    config: Arc<RelayConfig>,
    session: Arc<dyn Session>,
    dialer: Arc<dyn Dialer>,
    selector: Arc<PathSelector>,
    tunnels: Arc<TunnelManager>,
    target: TargetSlot,
}

impl RelayEngine {
    pub fn new(
        config: Arc<RelayConfig>,
        session: Arc<dyn Session>,
        dialer: Arc<dyn Dialer>,
        selector: Arc<PathSelector>,
        tunnels: Arc<TunnelManager>,
        target: TargetSlot,
    ) -> Self {
        Self {
            config,
            session,
            dialer,
            selector,
            tunnels,
            target,
        }
    }

    pub fn target(&self) -> Option<UpstreamTarget> {
        self.target.read().ok().and_then(|t| t.clone())
    }

    fn set_target(&self, target: UpstreamTarget) {
        if let Ok(mut slot) = self.target.write() {
            *slot = Some(target);
        }
    }

    /// Handle every peer delivered by the tunnel manager
    pub async fn run(
        self: Arc<Self>,
        mut peers: mpsc::UnboundedReceiver<AcceptedPeer>,
        cancel: CancellationToken,
    ) {
        loop {
            let peer = tokio::select! {
                _ = cancel.cancelled() => break,
                peer = peers.recv() => match peer {
                    Some(peer) => peer,
                    None => break,
                },
            };

            let engine = self.clone();
            tokio::spawn(async move {
                let tunnel_id = peer.tunnel_id;
                if let Err(e) = engine.handle_peer(peer).await {
                    warn!("Relay session on tunnel {} ended: {}", tunnel_id, e);
                }
            });
        }
        debug!("Relay engine stopped");
    }

    /// Relay one peer from login until disconnect or handoff
    pub async fn handle_peer(&self, peer: AcceptedPeer) -> Result<(), RelayError> {
        let client = Arc::new(ProxyConnection::new(
            peer.conn,
            self.config.max_decompressed_size,
        ));

        let server = match self.connect(&client).await {
            Ok(server) => server,
            Err(e) => {
                if !matches!(e, RelayError::Login(LoginError::UnsupportedProtocol { .. })) {
                    self.fail_client(&client, &e).await;
                } else {
                    tokio::time::sleep(self.config.drain_delay).await;
                    client.close().await;
                }
                return Err(e);
            }
        };

        info!(
            "Relaying {} via tunnel {} to {}",
            client.remote_addr(),
            peer.tunnel_id,
            server.remote_addr()
        );
        self.relay(client, server).await
    }

    /// Accept the peer's login and log in upstream on its behalf
    async fn connect(&self, client: &ProxyConnection) -> Result<Arc<ProxyConnection>, RelayError> {
        let verified = tokio::time::timeout(
            self.config.login_timeout,
            client.accept_login(self.session.as_ref(), &self.config),
        )
        .await
        .map_err(|_| RelayError::Timeout)??;

        if verified.identity.xuid != self.session.xuid() {
            warn!(
                "Peer logged in as {} but the session belongs to {}",
                verified.identity.xuid,
                self.session.xuid()
            );
            return Err(RelayError::AccountMismatch);
        }

        let target = self.target().ok_or(RelayError::NoTarget)?;
        let upstream = self
            .dialer
            .dial(&target.dial)
            .await
            .map_err(|e| RelayError::Upstream {
                address: target.dial.clone(),
                reason: e.to_string(),
            })?;
        let server = Arc::new(ProxyConnection::new(
            upstream,
            self.config.max_decompressed_size,
        ));

        let mut client_data = verified.client_data;
        client_data.normalize(&target.nominal);

        let login = tokio::time::timeout(
            self.config.login_timeout,
            server.login(&client_data, self.session.as_ref(), client.protocol()),
        )
        .await
        .map_err(|_| RelayError::Timeout)
        .and_then(|r| r.map_err(RelayError::from));
        if let Err(e) = login {
            server.close().await;
            return Err(e);
        }

        debug!("Logged in to {} as {}", target.nominal, verified.identity.display_name);
        Ok(server)
    }

    async fn relay(
        &self,
        client: Arc<ProxyConnection>,
        server: Arc<ProxyConnection>,
    ) -> Result<(), RelayError> {
        let migration_pending = Arc::new(AtomicBool::new(false));

        let upstream_pump = {
            let client = client.clone();
            let server = server.clone();
            let migration_pending = migration_pending.clone();
            tokio::spawn(async move {
                loop {
                    let packets = match client.read_packets().await {
                        Ok(packets) => packets,
                        Err(e) => {
                            if !e.is_closed() {
                                error!("Client read failed: {}", e);
                            }
                            break;
                        }
                    };
                    if let Err(e) = server.write_packets(&packets).await {
                        if !e.is_closed() {
                            error!("Upstream write failed: {}", e);
                        }
                        break;
                    }
                }
                server.close().await;
                if !migration_pending.load(Ordering::SeqCst) {
                    client.close().await;
                }
            })
        };

        let result = self
            .downstream_pump(&client, &server, &migration_pending)
            .await;

        // Both directions end together
        client.close().await;
        server.close().await;
        let _ = upstream_pump.await;
        result
    }

    async fn downstream_pump(
        &self,
        client: &ProxyConnection,
        server: &ProxyConnection,
        migration_pending: &AtomicBool,
    ) -> Result<(), RelayError> {
        loop {
            let packets = match server.read_packets().await {
                Ok(packets) => packets,
                Err(e) => {
                    if migration_pending.load(Ordering::SeqCst) || client.is_closed() {
                        return Ok(());
                    }
                    if !e.is_closed() {
                        error!("Upstream read failed: {}", e);
                    }
                    let e = RelayError::from(e);
                    self.fail_client(client, &e).await;
                    return Err(e);
                }
            };

            if let Some((index, transfer)) = find_transfer(&packets, server.protocol()) {
                migration_pending.store(true, Ordering::SeqCst);
                client.write_packets(&packets[..index]).await?;
                return self.handoff(client, transfer).await;
            }

            if let Err(e) = client.write_packets(&packets).await {
                if !e.is_closed() {
                    error!("Client write failed: {}", e);
                }
                return Ok(());
            }
        }
    }

    /// Move the client to the Transfer's destination through a fresh tunnel
    async fn handoff(&self, client: &ProxyConnection, transfer: Transfer) -> Result<(), RelayError> {
        info!(
            "Upstream transferred {} to {}:{}",
            client.remote_addr(),
            transfer.address,
            transfer.port
        );

        let best = self
            .selector
            .select_best_address(&transfer.address, transfer.port)
            .await;
        self.set_target(UpstreamTarget {
            nominal: crate::join_host_port(&transfer.address, transfer.port),
            dial: crate::join_host_port(&best, transfer.port),
        });

        let tunnel_id = match self.tunnels.ensure_open().await {
            Ok(id) => id,
            Err(e) => {
                let e = RelayError::from(e);
                self.fail_client(client, &e).await;
                return Err(e);
            }
        };

        client.write_packet(&Transfer::to_tunnel(tunnel_id)).await?;
        tokio::time::sleep(self.config.drain_delay).await;
        client.close().await;
        Ok(())
    }

    /// Show the error to the client, let it drain, then hang up
    async fn fail_client(&self, client: &ProxyConnection, err: &RelayError) {
        if let Err(e) = client.disconnect(format!("Error: {}", err)).await {
            debug!("Could not deliver disconnect: {}", e);
        }
        tokio::time::sleep(self.config.drain_delay).await;
        client.close().await;
    }
}

/// First Transfer in a batch, with its position
fn find_transfer(packets: &[Bytes], protocol: i32) -> Option<(usize, Transfer)> {
    packets.iter().enumerate().find_map(|(i, raw)| {
        let packet = PacketData::parse(raw.clone()).ok()?;
        if packet.header().packet_id != Transfer::ID {
            return None;
        }
        match inspect(&packet, protocol) {
            Ok(Inspected::Transfer(transfer)) => Some((i, transfer)),
            Ok(_) => None,
            Err(e) => {
                warn!("Undecodable Transfer from upstream: {}", e);
                None
            }
        }
    })
}
