//! Loopback ingress
//!
//! The game client connects here first, over RakNet. The ingress answers the
//! network settings request, shows a placeholder world, and immediately
//! transfers the client to the peer tunnel. It never completes a login
//! itself. The same sockets answer LAN discovery pings so the relay shows up
//! as a local world.

use bytes::Bytes;
use netherlink_proto::{ServerStatus, StartGame, Transfer};
use netherlink_transport::{PacketConn, PacketListener, RakNetListener, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::conn::{ConnError, LoginError, ProxyConnection};
use crate::tunnel::{TunnelError, TunnelManager};

/// Protocol number advertised in discovery pongs; clients ignore it for LAN entries
const DISCOVERY_PROTOCOL: i32 = 100;
const DISCOVERY_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error(transparent)]
    Login(#[from] LoginError),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl IngressError {
    fn bind(addr: SocketAddr, e: impl std::fmt::Display) -> Self {
        IngressError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct LocalIngress {
    config: Arc<RelayConfig>,
    tunnels: Arc<TunnelManager>,
}

impl LocalIngress {
    pub fn new(config: Arc<RelayConfig>, tunnels: Arc<TunnelManager>) -> Self {
        Self { config, tunnels }
    }

    /// Bind the configured loopback listeners
    ///
    /// The IPv6 listener is optional: failing to bind it only logs a warning.
    pub async fn bind(&self) -> Result<Vec<RakNetListener>, IngressError> {
        let mut listeners = Vec::with_capacity(2);

        let v4 = self.config.ipv4_bind;
        listeners.push(
            RakNetListener::bind(v4)
                .await
                .map_err(|e| IngressError::bind(v4, e))?,
        );

        if let Some(v6) = self.config.ipv6_bind {
            match RakNetListener::bind(v6).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => warn!("IPv6 ingress on {} unavailable: {}", v6, e),
            }
        }

        if self.config.discovery {
            for listener in &listeners {
                let status = discovery_status(&self.config.server_name, listener.server_guid());
                listener.set_pong_data(Some(status));
            }
        }

        Ok(listeners)
    }

    /// Accept clients until the listener closes or `cancel` fires
    pub async fn serve(self: Arc<Self>, listener: Box<dyn PacketListener>, cancel: CancellationToken) {
        info!("Loopback ingress listening on {}", listener.local_addr());

        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(TransportError::ListenerClosed) => break,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            debug!("Accepted ingress connection from {}", conn.remote_addr());
            let ingress = self.clone();
            tokio::spawn(async move {
                let remote = conn.remote_addr();
                if let Err(e) = ingress.handle_client(conn).await {
                    warn!("Ingress connection from {} ended: {}", remote, e);
                }
            });
        }

        listener.close().await;
        debug!("Loopback ingress on {} stopped", listener.local_addr());
    }

    /// Send one client through the tunnel redirect
    pub async fn handle_client(&self, conn: Box<dyn PacketConn>) -> Result<(), IngressError> {
        let client = ProxyConnection::new(conn, self.config.max_decompressed_size);
        let result = self.redirect(&client).await;
        if result.is_ok() {
            tokio::time::sleep(self.config.drain_delay).await;
        }
        client.close().await;
        result
    }

    async fn redirect(&self, client: &ProxyConnection) -> Result<(), IngressError> {
        let protocol = match client.negotiate(&self.config).await {
            Ok(protocol) => protocol,
            Err(e @ LoginError::UnsupportedProtocol { .. }) => {
                tokio::time::sleep(self.config.drain_delay).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        debug!("[{}] Negotiated protocol {}", client.connection_id(), protocol);

        client.write_packet(&StartGame::default()).await?;

        let tunnel_id = match self.tunnels.ensure_open().await {
            Ok(id) => id,
            Err(e) => {
                if let Err(err) = client.disconnect(format!("Error: {}", e)).await {
                    debug!("Could not deliver disconnect: {}", err);
                }
                tokio::time::sleep(self.config.drain_delay).await;
                return Err(e.into());
            }
        };

        client.write_packet(&Transfer::to_tunnel(tunnel_id)).await?;
        info!("Redirected {} to tunnel {}", client.remote_addr(), tunnel_id);
        Ok(())
    }
}

/// Pong payload advertising the relay as a LAN world
pub fn discovery_status(server_name: &str, server_guid: i64) -> Bytes {
    ServerStatus {
        server_name: server_name.to_string(),
        world_name: server_name.to_string(),
        protocol_id: DISCOVERY_PROTOCOL,
        version: DISCOVERY_VERSION.to_string(),
        player_count: 0,
        max_players: 1,
        raknet_id: server_guid,
        game_mode: "Survival".to_string(),
    }
    .encode()
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::UnsignedSession;
    use bytes::Bytes;
    use netherlink_proto::shim::decode_packet;
    use netherlink_proto::{
        inspect, Disconnect, IdentityData, Inspected, NetworkSettings, PacketData,
        RequestNetworkSettings,
    };
    use netherlink_proto::{UnconnectedPing, UnconnectedPong};
    use netherlink_transport::{Dialer, MemoryConn, MemorySignaling, RakNetDialer};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn ingress(signaling: MemorySignaling) -> Arc<LocalIngress> {
        let config = RelayConfig::builder()
            .drain_delay(Duration::from_millis(10))
            .build()
            .unwrap();
        let (tunnels, _rx) = TunnelManager::new(
            Arc::new(signaling),
            Arc::new(UnsignedSession::new(IdentityData::default())),
        );
        let tunnels = tunnels.with_id_source(Box::new(|| 1234));
        Arc::new(LocalIngress::new(Arc::new(config), Arc::new(tunnels)))
    }

    #[tokio::test]
    async fn test_client_is_transferred_to_tunnel() {
        let signaling = MemorySignaling::new();
        let ingress = ingress(signaling.clone());
        let (game, relay_side) = MemoryConn::pair("game", "ingress");
        let handler = tokio::spawn(async move { ingress.handle_client(Box::new(relay_side)).await });

        let game = ProxyConnection::new(Box::new(game), 1 << 20);
        game.set_protocol(818);
        game.write_packet(&RequestNetworkSettings { client_protocol: 818 })
            .await
            .unwrap();

        let settings = game.read_packet().await.unwrap();
        let settings: NetworkSettings = decode_packet(&settings, 818).unwrap();
        assert_eq!(settings.compression_threshold, 0);
        game.enable_compression(netherlink_proto::Compression::Flate).await;

        let mut transfer = None;
        while transfer.is_none() {
            let packet = PacketData::parse(game.read_packet().await.unwrap()).unwrap();
            if let Inspected::Transfer(t) = inspect(&packet, 818).unwrap() {
                transfer = Some(t);
            }
        }
        assert_eq!(transfer.unwrap().address, "1234");

        handler.await.unwrap().unwrap();
        assert!(game.read_packet().await.is_err());
        assert!(signaling.is_published(1234));
    }

    #[tokio::test]
    async fn test_outdated_client_is_rejected() {
        let signaling = MemorySignaling::new();
        let ingress = ingress(signaling.clone());
        let (game, relay_side) = MemoryConn::pair("game", "ingress");
        let handler = tokio::spawn(async move { ingress.handle_client(Box::new(relay_side)).await });

        let game = ProxyConnection::new(Box::new(game), 1 << 20);
        game.set_protocol(800);
        game.write_packet(&RequestNetworkSettings { client_protocol: 800 })
            .await
            .unwrap();

        let packet: Bytes = game.read_packet().await.unwrap();
        let disconnect: Disconnect = decode_packet(&packet, 800).unwrap();
        assert_eq!(
            disconnect.message,
            "NetherLink requires Minecraft 1.21.90 or newer."
        );

        assert!(matches!(
            handler.await.unwrap(),
            Err(IngressError::Login(LoginError::UnsupportedProtocol { protocol: 800, .. }))
        ));
        assert!(signaling.published().is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_failure_disconnects_client() {
        let signaling = MemorySignaling::new();
        signaling.set_unavailable(true);
        let ingress = ingress(signaling.clone());
        let (game, relay_side) = MemoryConn::pair("game", "ingress");
        let handler = tokio::spawn(async move { ingress.handle_client(Box::new(relay_side)).await });

        let game = ProxyConnection::new(Box::new(game), 1 << 20);
        game.set_protocol(818);
        game.write_packet(&RequestNetworkSettings { client_protocol: 818 })
            .await
            .unwrap();
        let _settings = game.read_packet().await.unwrap();
        game.enable_compression(netherlink_proto::Compression::Flate).await;

        let mut disconnect = None;
        while disconnect.is_none() {
            let packet = game.read_packet().await.unwrap();
            if let Ok(d) = decode_packet::<Disconnect>(&packet, 818) {
                disconnect = Some(d);
            }
        }
        assert!(disconnect.unwrap().message.starts_with("Error: Failed to publish tunnel"));

        assert!(matches!(
            handler.await.unwrap(),
            Err(IngressError::Tunnel(_))
        ));
        assert!(signaling.published().is_empty());
    }

    #[tokio::test]
    async fn test_ingress_answers_discovery_pings() {
        let config = RelayConfig::builder()
            .ipv4_bind("127.0.0.1:0".parse().unwrap())
            .ipv6_bind(None)
            .build()
            .unwrap();
        let (tunnels, _rx) = TunnelManager::new(
            Arc::new(MemorySignaling::new()),
            Arc::new(UnsignedSession::new(IdentityData::default())),
        );
        let ingress = LocalIngress::new(Arc::new(config), Arc::new(tunnels));
        let listeners = ingress.bind().await.unwrap();
        assert_eq!(listeners.len(), 1);
        let addr = listeners[0].socket_addr();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ping = UnconnectedPing {
            send_timestamp: 5,
            client_guid: 1,
        };
        socket.send_to(&ping.encode(), addr).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let pong = UnconnectedPong::decode(&buf[..n]).unwrap();
        assert_eq!(pong.send_timestamp, 5);
        assert_eq!(pong.server_guid, listeners[0].server_guid());

        let status = ServerStatus::parse(&pong.data).unwrap();
        assert_eq!(status.server_name, "NetherLink");
        assert_eq!(status.protocol_id, 100);
        assert_eq!(status.max_players, 1);
        assert_eq!(status.game_mode, "Survival");
        assert!(String::from_utf8_lossy(&pong.data).starts_with("MCPE;NetherLink;100;1.0;0;1;"));
    }

    #[tokio::test]
    async fn test_game_client_reaches_ingress_over_raknet() {
        let config = RelayConfig::builder()
            .ipv4_bind("127.0.0.1:0".parse().unwrap())
            .ipv6_bind(None)
            .drain_delay(Duration::from_millis(10))
            .build()
            .unwrap();
        let (tunnels, _rx) = TunnelManager::new(
            Arc::new(MemorySignaling::new()),
            Arc::new(UnsignedSession::new(IdentityData::default())),
        );
        let tunnels = tunnels.with_id_source(Box::new(|| 1234));
        let ingress = Arc::new(LocalIngress::new(Arc::new(config), Arc::new(tunnels)));
        let mut listeners = ingress.bind().await.unwrap();
        let listener = listeners.remove(0);
        let addr = listener.socket_addr().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(ingress.serve(Box::new(listener), cancel.clone()));

        let conn = RakNetDialer::new(Duration::from_secs(5)).dial(&addr).await.unwrap();
        let game = ProxyConnection::new(conn, 1 << 20);
        game.set_protocol(818);
        game.write_packet(&RequestNetworkSettings { client_protocol: 818 })
            .await
            .unwrap();
        let settings = game.read_packet().await.unwrap();
        let _: NetworkSettings = decode_packet(&settings, 818).unwrap();

        cancel.cancel();
    }
}
