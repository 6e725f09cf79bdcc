//! Proxy relay for Bedrock multiplayer over a peer tunnel
//!
//! The game client is pointed at a loopback ingress, which transfers it into
//! a peer tunnel. The relay engine on the far side of that tunnel logs in to
//! the real server as the session's account and relays batches. Server-side
//! transfers are intercepted so the client always comes back through a fresh
//! tunnel.
//!
//! ```text
//!  game client ──► LocalIngress ──Transfer(tunnel id)──► game client
//!                                                          │
//!                                   Signaling / tunnel ◄───┘
//!                                          │
//!                                     RelayEngine ──► upstream server
//! ```

pub mod config;
pub mod conn;
pub mod ingress;
pub mod path_selector;
pub mod relay;
pub mod session;
pub mod status_poller;
pub mod tunnel;

pub use config::RelayConfig;
pub use conn::{ConnError, LoginError, ProxyConnection};
pub use ingress::{discovery_status, IngressError, LocalIngress};
pub use path_selector::{EchoProber, PathSelector, PingResult, RakNetProber, Resolver, SystemResolver};
pub use relay::{RelayEngine, RelayError};
pub use session::{Session, SessionError, UnsignedSession};
pub use status_poller::{StatusCallback, StatusPoller};
pub use tunnel::{AcceptedPeer, TunnelError, TunnelIdSource, TunnelManager};

use netherlink_transport::{Dialer, PacketListener, Signaling};
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Where the relay sends the next login
///
/// `nominal` is the address the user (or the last Transfer) asked for and is
/// what the upstream sees in the client data; `dial` is the address actually
/// connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub nominal: String,
    pub dial: String,
}

/// `host:port`, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Builder-style wiring of the relay components
pub struct RelayServiceBuilder {
    config: RelayConfig,
    session: Arc<dyn Session>,
    signaling: Arc<dyn Signaling>,
    dialer: Arc<dyn Dialer>,
    selector: Option<PathSelector>,
    id_source: Option<TunnelIdSource>,
}

impl RelayServiceBuilder {
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn path_selector(mut self, selector: PathSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn tunnel_ids(mut self, source: TunnelIdSource) -> Self {
        self.id_source = Some(source);
        self
    }

    pub fn build(self) -> RelayService {
        let config = Arc::new(self.config);
        let selector = Arc::new(self.selector.unwrap_or_else(|| {
            PathSelector::system(config.probe_count, config.probe_timeout)
        }));

        let (tunnels, peers) = TunnelManager::new(self.signaling, self.session.clone());
        let tunnels = Arc::new(match self.id_source {
            Some(source) => tunnels.with_id_source(source),
            None => tunnels,
        });

        let target = Arc::new(RwLock::new(None));
        let engine = Arc::new(RelayEngine::new(
            config.clone(),
            self.session,
            self.dialer,
            selector.clone(),
            tunnels.clone(),
            target.clone(),
        ));
        let ingress = Arc::new(LocalIngress::new(config.clone(), tunnels.clone()));

        RelayService {
            config,
            selector,
            tunnels,
            engine,
            ingress,
            target,
            peers: StdMutex::new(Some(peers)),
            cancel: CancellationToken::new(),
        }
    }
}

/// Assembled relay: ingress, tunnel manager and engine sharing one target
pub struct RelayService {
    config: Arc<RelayConfig>,
    selector: Arc<PathSelector>,
    tunnels: Arc<TunnelManager>,
    engine: Arc<RelayEngine>,
    ingress: Arc<LocalIngress>,
    target: relay::TargetSlot,
    peers: StdMutex<Option<mpsc::UnboundedReceiver<AcceptedPeer>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("target", &self.target())
            .field("tunnel", &self.tunnels.current_id())
            .finish()
    }
}

impl RelayService {
    pub fn builder(
        session: Arc<dyn Session>,
        signaling: Arc<dyn Signaling>,
        dialer: Arc<dyn Dialer>,
    ) -> RelayServiceBuilder {
        RelayServiceBuilder {
            config: RelayConfig::default(),
            session,
            signaling,
            dialer,
            selector: None,
            id_source: None,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    pub fn target(&self) -> Option<UpstreamTarget> {
        self.engine.target()
    }

    /// Choose the server the next client login is relayed to
    pub async fn join(&self, host: &str, port: u16) -> UpstreamTarget {
        let best = self.selector.select_best_address(host, port).await;
        let target = UpstreamTarget {
            nominal: join_host_port(host, port),
            dial: join_host_port(&best, port),
        };
        if let Ok(mut slot) = self.target.write() {
            *slot = Some(target.clone());
        }
        info!("Next login goes to {} via {}", target.nominal, target.dial);
        target
    }

    /// Start the relay engine and serve the configured loopback ingress
    pub async fn start(&self) -> Result<(), IngressError> {
        self.spawn_engine();

        for listener in self.ingress.bind().await? {
            self.serve_ingress(Box::new(listener));
        }
        if !self.config.discovery {
            info!("LAN discovery disabled");
        }
        Ok(())
    }

    /// Start the relay engine without binding anything
    ///
    /// Only the first call has an effect.
    pub fn spawn_engine(&self) {
        let peers = self.peers.lock().ok().and_then(|mut p| p.take());
        if let Some(peers) = peers {
            tokio::spawn(self.engine.clone().run(peers, self.cancel.child_token()));
        }
    }

    /// Serve ingress clients from an already-bound listener
    pub fn serve_ingress(&self, listener: Box<dyn PacketListener>) {
        tokio::spawn(self.ingress.clone().serve(listener, self.cancel.child_token()));
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tunnels.close().await;
        info!("Relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("play.example.net", 19132), "play.example.net:19132");
        assert_eq!(join_host_port("203.0.113.5", 1), "203.0.113.5:1");
        assert_eq!(join_host_port("2001:db8::1", 19133), "[2001:db8::1]:19133");
    }
}
