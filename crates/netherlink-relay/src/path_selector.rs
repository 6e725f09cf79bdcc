//! Lowest-latency address selection
//!
//! A hostname often resolves to several addresses. Each one is probed a few
//! times over a connectionless echo (RakNet unconnected ping) and the address
//! with the lowest mean round trip wins. Resolution failures fall back to the
//! hostname itself.

use async_trait::async_trait;
use netherlink_proto::{UnconnectedPing, UnconnectedPong};
use std::fmt::Debug;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info};

/// Resolves a hostname to candidate addresses, in preference order
#[async_trait]
pub trait Resolver: Send + Sync + Debug {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Sends one echo request and waits for its reply
#[async_trait]
pub trait EchoProber: Send + Sync + Debug {
    async fn probe(&self, addr: SocketAddr) -> io::Result<()>;
}

/// System DNS resolver
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let mut addrs: Vec<IpAddr> = Vec::new();
        for addr in tokio::net::lookup_host((host, 0)).await? {
            if !addrs.contains(&addr.ip()) {
                addrs.push(addr.ip());
            }
        }
        Ok(addrs)
    }
}

/// Probes with RakNet unconnected pings from an ephemeral UDP socket
#[derive(Debug, Clone)]
pub struct RakNetProber {
    timeout: Duration,
    client_guid: i64,
}

impl RakNetProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client_guid: rand::random(),
        }
    }
}

#[async_trait]
impl EchoProber for RakNetProber {
    async fn probe(&self, addr: SocketAddr) -> io::Result<()> {
        let bind: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;

        let ping = UnconnectedPing {
            send_timestamp: chrono::Utc::now().timestamp_millis(),
            client_guid: self.client_guid,
        };
        socket.send(&ping.encode()).await?;

        let mut buf = vec![0u8; 1500];
        tokio::time::timeout(self.timeout, async {
            loop {
                let n = socket.recv(&mut buf).await?;
                if UnconnectedPong::decode(&buf[..n]).is_ok() {
                    return Ok(());
                }
            }
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "ping timed out"))?
    }
}

/// Probe outcome for one candidate address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResult {
    pub address: IpAddr,
    /// Mean round trip over successful probes; `None` when every probe failed
    pub mean: Option<Duration>,
    pub successes: u32,
}

impl PingResult {
    /// Mean latency, unbounded when unreachable
    pub fn latency(&self) -> Duration {
        self.mean.unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct PathSelector {
    resolver: Arc<dyn Resolver>,
    prober: Arc<dyn EchoProber>,
    probe_count: u32,
}

impl PathSelector {
    pub fn new(resolver: Arc<dyn Resolver>, prober: Arc<dyn EchoProber>, probe_count: u32) -> Self {
        Self {
            resolver,
            prober,
            probe_count,
        }
    }

    /// System resolver with RakNet probes
    pub fn system(probe_count: u32, probe_timeout: Duration) -> Self {
        Self::new(
            Arc::new(SystemResolver),
            Arc::new(RakNetProber::new(probe_timeout)),
            probe_count,
        )
    }

    /// Probe every resolved address of `host` concurrently
    pub async fn probe_all(&self, host: &str, port: u16) -> io::Result<Vec<PingResult>> {
        let addresses = self.resolver.resolve(host).await?;

        let handles: Vec<_> = addresses
            .into_iter()
            .map(|address| {
                let prober = self.prober.clone();
                let count = self.probe_count;
                tokio::spawn(async move {
                    let result = probe_address(prober.as_ref(), address, port, count).await;
                    info!(
                        "Pinged {} ({}/{} replies, mean {:?})",
                        address, result.successes, count, result.mean
                    );
                    result
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(io::Error::other)?);
        }
        Ok(results)
    }

    /// Lowest mean among reachable candidates; earlier entries win ties
    pub fn best_of(results: &[PingResult]) -> Option<&PingResult> {
        let mut best: Option<&PingResult> = None;
        for result in results.iter().filter(|r| r.mean.is_some()) {
            if best.map_or(true, |b| result.latency() < b.latency()) {
                best = Some(result);
            }
        }
        best
    }

    /// Best address for `host` as a string, or `host` unchanged if nothing answered
    pub async fn select_best_address(&self, host: &str, port: u16) -> String {
        let results = match self.probe_all(host, port).await {
            Ok(results) => results,
            Err(e) => {
                debug!("Resolving {} failed, using it as-is: {}", host, e);
                return host.to_string();
            }
        };

        match Self::best_of(&results) {
            Some(best) => {
                info!("Selected {} for {}", best.address, host);
                best.address.to_string()
            }
            None => host.to_string(),
        }
    }
}

async fn probe_address(prober: &dyn EchoProber, address: IpAddr, port: u16, count: u32) -> PingResult {
    let target = SocketAddr::new(address, port);
    let mut total = Duration::ZERO;
    let mut successes = 0u32;

    for _ in 0..count {
        let start = Instant::now();
        match prober.probe(target).await {
            Ok(()) => {
                total += start.elapsed();
                successes += 1;
            }
            Err(e) => debug!("Probe to {} failed: {}", target, e),
        }
    }

    PingResult {
        address,
        mean: (successes > 0).then(|| total / successes),
        successes,
    }
}
