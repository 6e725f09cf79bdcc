//! Periodic server status polling
//!
//! One UDP socket sends RakNet unconnected pings to every registered server
//! and dispatches parsed pongs to the callback registered for the sender's
//! address. A probe cycle pings each server in turn, spaced out, then waits
//! for the remainder of the cycle.

use netherlink_proto::{ServerStatus, UnconnectedPing, UnconnectedPong};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::RelayConfig;

/// Receives every status reported by one server
pub type StatusCallback = Arc<dyn Fn(ServerStatus) + Send + Sync>;

struct Inner {
    socket: UdpSocket,
    dual_stack: bool,
    servers: RwLock<HashMap<SocketAddr, StatusCallback>>,
    client_guid: i64,
    started: Instant,
    cycle: Duration,
    spacing: Duration,
    cancel: CancellationToken,
}

/// Polls registered servers for their status
pub struct StatusPoller {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StatusPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPoller")
            .field("servers", &self.server_count())
            .field("cycle", &self.inner.cycle)
            .finish()
    }
}

impl StatusPoller {
    /// Bind the polling socket and start the receive and probe loops
    pub async fn start(config: &RelayConfig) -> io::Result<Self> {
        Self::start_with(config.status_cycle, config.status_spacing).await
    }

    pub async fn start_with(cycle: Duration, spacing: Duration) -> io::Result<Self> {
        let (socket, dual_stack) =
            match UdpSocket::bind(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))).await {
                Ok(socket) => (socket, true),
                Err(e) => {
                    debug!("IPv6 socket unavailable, polling over IPv4 only: {}", e);
                    (UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?, false)
                }
            };

        let inner = Arc::new(Inner {
            socket,
            dual_stack,
            servers: RwLock::new(HashMap::new()),
            client_guid: rand::random(),
            started: Instant::now(),
            cycle,
            spacing,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(receive_loop(inner.clone()));
        tokio::spawn(probe_loop(inner.clone()));

        Ok(Self { inner })
    }

    /// Register `address` (host:port) and ping it right away
    pub async fn add_server(&self, address: &str, callback: StatusCallback) -> io::Result<SocketAddr> {
        let addr = resolve(address).await?;
        self.inner
            .servers
            .write()
            .map_err(|_| io::Error::other("server table poisoned"))?
            .insert(addr, callback);
        debug!("Polling status of {} ({})", address, addr);

        if let Err(e) = self.inner.ping(addr).await {
            debug!("Initial ping to {} failed: {}", addr, e);
        }
        Ok(addr)
    }

    pub async fn remove_server(&self, address: &str) -> io::Result<()> {
        let addr = resolve(address).await?;
        self.inner
            .servers
            .write()
            .map_err(|_| io::Error::other("server table poisoned"))?
            .remove(&addr);
        Ok(())
    }

    pub fn server_count(&self) -> usize {
        self.inner.servers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Stop both loops and release the socket
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    async fn ping(&self, addr: SocketAddr) -> io::Result<()> {
        let ping = UnconnectedPing {
            send_timestamp: self.started.elapsed().as_millis() as i64,
            client_guid: self.client_guid,
        };
        let target = if self.dual_stack { to_mapped(addr) } else { addr };
        self.socket.send_to(&ping.encode(), target).await?;
        trace!("Sent status ping to {}", addr);
        Ok(())
    }

    fn callback_for(&self, addr: &SocketAddr) -> Option<StatusCallback> {
        self.servers.read().ok()?.get(addr).cloned()
    }

    fn snapshot(&self) -> Vec<SocketAddr> {
        self.servers
            .read()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }
}

async fn receive_loop(inner: Arc<Inner>) {
    let mut buf = vec![0u8; 1500];
    loop {
        let (n, from) = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            result = inner.socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    // ICMP unreachable surfaces as a receive error on some platforms
                    trace!("Status socket receive error: {}", e);
                    continue;
                }
            },
        };

        let from = unmap(from);
        let Some(callback) = inner.callback_for(&from) else {
            trace!("Ignoring datagram from unregistered {}", from);
            continue;
        };

        let pong = match UnconnectedPong::decode(&buf[..n]) {
            Ok(pong) => pong,
            Err(e) => {
                trace!("Ignoring non-pong datagram from {}: {}", from, e);
                continue;
            }
        };

        match ServerStatus::parse(&pong.data) {
            Ok(status) => callback(status),
            Err(e) => debug!("Bad status payload from {}: {}", from, e),
        }
    }
    debug!("Status receive loop stopped");
}

async fn probe_loop(inner: Arc<Inner>) {
    loop {
        let servers = inner.snapshot();
        for addr in &servers {
            if let Err(e) = inner.ping(*addr).await {
                warn!("Status ping to {} failed: {}", addr, e);
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(inner.spacing) => {}
            }
        }

        let spent = inner.spacing.saturating_mul(servers.len() as u32);
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.cycle.saturating_sub(spent)) => {}
        }
    }
}

async fn resolve(address: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .map(unmap)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", address)))
}

fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

fn to_mapped(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()),
        IpAddr::V6(_) => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    /// Answers every ping with a fixed status
    async fn pong_server(status: ServerStatus) -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (pinged, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let Ok(ping) = UnconnectedPing::decode(&buf[..n]) else {
                    continue;
                };
                let _ = pinged.send(());
                let pong = UnconnectedPong {
                    send_timestamp: ping.send_timestamp,
                    server_guid: 99,
                    data: Bytes::from(status.encode()),
                };
                let _ = socket.send_to(&pong.encode(), from).await;
            }
        });
        (addr, rx)
    }

    fn status(name: &str, players: u32) -> ServerStatus {
        ServerStatus {
            server_name: name.to_string(),
            world_name: "world".to_string(),
            protocol_id: 827,
            version: "1.21.100".to_string(),
            player_count: players,
            max_players: 20,
            raknet_id: 99,
            game_mode: "Survival".to_string(),
        }
    }

    #[test]
    fn test_unmap_v4_in_v6() {
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:19132".parse().unwrap();
        assert_eq!(unmap(mapped).to_string(), "127.0.0.1:19132");

        let v6: SocketAddr = "[2001:db8::1]:1".parse().unwrap();
        assert_eq!(unmap(v6), v6);
        assert_eq!(unmap(to_mapped("10.0.0.1:5".parse().unwrap())).to_string(), "10.0.0.1:5");
    }

    #[tokio::test]
    async fn test_add_server_pings_immediately_and_dispatches() {
        let (addr, _pings) = pong_server(status("Lobby", 7)).await;
        let poller = StatusPoller::start_with(Duration::from_secs(60), Duration::from_millis(10))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let registered = poller
            .add_server(
                &addr.to_string(),
                Arc::new(move |status: ServerStatus| {
                    let _ = tx.send(status);
                }),
            )
            .await
            .unwrap();
        assert_eq!(registered, addr);
        assert_eq!(poller.server_count(), 1);

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.server_name, "Lobby");
        assert_eq!(got.player_count, 7);

        poller.close();
    }

    #[tokio::test]
    async fn test_cycle_repings_registered_servers() {
        let (addr, mut pings) = pong_server(status("S", 1)).await;
        let poller = StatusPoller::start_with(Duration::from_millis(50), Duration::from_millis(5))
            .await
            .unwrap();
        poller
            .add_server(&addr.to_string(), Arc::new(|_| {}))
            .await
            .unwrap();

        // Initial ping plus at least two cycles
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), pings.recv())
                .await
                .unwrap()
                .unwrap();
        }

        poller.remove_server(&addr.to_string()).await.unwrap();
        assert_eq!(poller.server_count(), 0);
        poller.close();
    }

    #[tokio::test]
    async fn test_unresolvable_server_is_an_error() {
        let poller = StatusPoller::start_with(Duration::from_secs(5), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(poller.add_server("not an address", Arc::new(|_| {})).await.is_err());
        assert_eq!(poller.server_count(), 0);
    }
}
