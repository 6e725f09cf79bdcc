//! End-to-end relay tests over in-memory transports
//!
//! A fake game client goes through the loopback ingress, follows the Transfer
//! into the tunnel and is relayed to fake upstream servers. The upstream
//! servers reuse `ProxyConnection::accept_login` for their half of the login.

use async_trait::async_trait;
use netherlink_proto::{
    inspect, ClientData, Compression, IdentityData, Inspected, PacketData, PlayStatus,
    RequestNetworkSettings, Transfer,
};
use netherlink_relay::session::VerifiedLogin;
use netherlink_relay::{
    EchoProber, LoginError, PathSelector, ProxyConnection, RelayConfig, RelayService, Resolver,
    UnsignedSession, UpstreamTarget,
};
use netherlink_transport::{
    Dialer, HeaderedConn, MemoryListener, MemoryNetwork, MemorySignaling, PacketConn,
    PacketListener,
};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const XUID: &str = "2535400000000001";
const PROTOCOL: i32 = 818;
const MAX_BATCH: usize = 1 << 20;
const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct StaticResolver(HashMap<&'static str, IpAddr>);

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self.0
            .get(host)
            .map(|ip| vec![*ip])
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
    }
}

#[derive(Debug)]
struct InstantProber;

#[async_trait]
impl EchoProber for InstantProber {
    async fn probe(&self, _addr: SocketAddr) -> io::Result<()> {
        Ok(())
    }
}

struct Harness {
    service: RelayService,
    network: MemoryNetwork,
    signaling: MemorySignaling,
    play: Arc<MemoryListener>,
    lobby: Arc<MemoryListener>,
}

fn session(xuid: &str) -> UnsignedSession {
    UnsignedSession::new(IdentityData {
        xuid: xuid.to_string(),
        display_name: "Steve".to_string(),
        ..Default::default()
    })
}

fn config() -> RelayConfig {
    RelayConfig::builder()
        .drain_delay(Duration::from_millis(10))
        .login_timeout(TIMEOUT)
        .build()
        .unwrap()
}

async fn harness() -> Harness {
    let network = MemoryNetwork::new();
    let signaling = MemorySignaling::new();
    let play = Arc::new(network.listen("203.0.113.5:19132").unwrap());
    let lobby = Arc::new(network.listen("198.51.100.7:19133").unwrap());

    let resolver = StaticResolver(HashMap::from([
        ("play.example.net", "203.0.113.5".parse().unwrap()),
        ("lobby.example.net", "198.51.100.7".parse().unwrap()),
    ]));
    let ids = [1234u64, 5678];
    let next = AtomicUsize::new(0);

    let service = RelayService::builder(
        Arc::new(session(XUID)),
        Arc::new(signaling.clone()),
        Arc::new(network.clone()),
    )
    .config(config())
    .path_selector(PathSelector::new(
        Arc::new(resolver),
        Arc::new(InstantProber),
        3,
    ))
    .tunnel_ids(Box::new(move || {
        ids[next.fetch_add(1, Ordering::SeqCst).min(ids.len() - 1)]
    }))
    .build();

    service.spawn_engine();
    service.serve_ingress(Box::new(network.listen("127.0.0.1:19132").unwrap()));

    Harness {
        service,
        network,
        signaling,
        play,
        lobby,
    }
}

/// Read until a Transfer arrives
async fn expect_transfer(conn: &ProxyConnection) -> Transfer {
    loop {
        let raw = tokio::time::timeout(TIMEOUT, conn.read_packet())
            .await
            .expect("timed out waiting for transfer")
            .expect("connection closed before transfer");
        let packet = PacketData::parse(raw).unwrap();
        if let Inspected::Transfer(transfer) = inspect(&packet, PROTOCOL).unwrap() {
            return transfer;
        }
    }
}

/// Walk through the loopback ingress and return the tunnel id it points at
async fn through_ingress(network: &MemoryNetwork) -> String {
    let conn = network.dial("127.0.0.1:19132").await.unwrap();
    let game = ProxyConnection::new(conn, MAX_BATCH);
    game.set_protocol(PROTOCOL);
    game.write_packet(&RequestNetworkSettings {
        client_protocol: PROTOCOL,
    })
    .await
    .unwrap();
    // NetworkSettings arrives uncompressed
    game.read_packet().await.unwrap();
    game.enable_compression(Compression::Flate).await;

    expect_transfer(&game).await.address
}

/// Dial a tunnel the way the game client does
async fn dial_tunnel(signaling: &MemorySignaling, tunnel_id: &str) -> ProxyConnection {
    let peer = signaling.dial(tunnel_id.parse().unwrap()).await.unwrap();
    ProxyConnection::new(Box::new(HeaderedConn::new(Box::new(peer))), MAX_BATCH)
}

async fn game_login(game: &ProxyConnection, xuid: &str, protocol: i32) -> Result<(), LoginError> {
    let client_data = ClientData {
        device_os: 1,
        game_version: "1.21.90".to_string(),
        server_address: "127.0.0.1:19132".to_string(),
        ..Default::default()
    };
    game.login(&client_data, &session(xuid), protocol).await
}

/// Fake upstream: accept one login and report it
async fn upstream_login(listener: &MemoryListener) -> (ProxyConnection, VerifiedLogin) {
    let conn: Box<dyn PacketConn> = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .expect("upstream never dialed")
        .unwrap();
    let server = ProxyConnection::new(conn, MAX_BATCH);
    let verified = server
        .accept_login(&session("upstream"), &config())
        .await
        .unwrap();
    server.write_packet(&PlayStatus { status: 0 }).await.unwrap();
    (server, verified)
}

#[tokio::test]
async fn test_handoff_follows_upstream_transfer() {
    let h = harness().await;
    let joined = h.service.join("play.example.net", 19132).await;
    assert_eq!(
        joined,
        UpstreamTarget {
            nominal: "play.example.net:19132".to_string(),
            dial: "203.0.113.5:19132".to_string(),
        }
    );

    // Leg one: ingress to tunnel 1234, relayed to play.example.net
    let tunnel = through_ingress(&h.network).await;
    assert_eq!(tunnel, "1234");

    let game = dial_tunnel(&h.signaling, &tunnel).await;
    let upstream = tokio::spawn({
        let play = h.play.clone();
        async move {
            let (server, verified) = upstream_login(&play).await;
            server
                .write_packet(&Transfer {
                    address: "lobby.example.net".to_string(),
                    port: 19133,
                    reload_world: false,
                })
                .await
                .unwrap();
            (server, verified)
        }
    });

    game_login(&game, XUID, PROTOCOL).await.unwrap();
    let (first_server, verified) = upstream.await.unwrap();
    assert_eq!(verified.identity.xuid, XUID);
    assert_eq!(verified.client_data.server_address, "play.example.net:19132");
    assert_eq!(verified.client_data.device_os, 7);
    assert_eq!(verified.client_data.game_version, "1.21.90.24");

    // The upstream Transfer is replaced by one into a fresh tunnel
    let handoff = expect_transfer(&game).await;
    assert_eq!(handoff.address, "5678");
    assert_eq!(handoff.port, 0);

    let closed = tokio::time::timeout(TIMEOUT, async {
        while game.read_packet().await.is_ok() {}
    })
    .await;
    assert!(closed.is_ok(), "client was not closed after handoff");

    let upstream_closed = tokio::time::timeout(TIMEOUT, async {
        while first_server.read_packets().await.is_ok() {}
    })
    .await;
    assert!(upstream_closed.is_ok(), "first upstream connection stayed open");

    assert_eq!(
        h.service.target(),
        Some(UpstreamTarget {
            nominal: "lobby.example.net:19133".to_string(),
            dial: "198.51.100.7:19133".to_string(),
        })
    );

    // The first tunnel accepted exactly one peer
    assert!(h.signaling.dial(1234).await.is_err());

    // Leg two: the client follows into tunnel 5678 and lands on the lobby
    let game = dial_tunnel(&h.signaling, "5678").await;
    let upstream = tokio::spawn({
        let lobby = h.lobby.clone();
        async move { upstream_login(&lobby).await }
    });
    game_login(&game, XUID, PROTOCOL).await.unwrap();
    let (_server, verified) = upstream.await.unwrap();
    assert_eq!(verified.client_data.server_address, "lobby.example.net:19133");

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_packets_before_transfer_are_forwarded() {
    let h = harness().await;
    h.service.join("play.example.net", 19132).await;

    let tunnel = through_ingress(&h.network).await;
    let game = dial_tunnel(&h.signaling, &tunnel).await;
    let upstream = tokio::spawn({
        let play = h.play.clone();
        async move {
            let (server, _) = upstream_login(&play).await;
            let packets = vec![
                netherlink_proto::encode_packet(&PlayStatus { status: 3 }, PROTOCOL),
                netherlink_proto::encode_packet(
                    &Transfer {
                        address: "lobby.example.net".to_string(),
                        port: 19133,
                        reload_world: false,
                    },
                    PROTOCOL,
                ),
            ];
            server.write_packets(&packets).await.unwrap();
            server
        }
    });

    game_login(&game, XUID, PROTOCOL).await.unwrap();
    let _server = upstream.await.unwrap();

    let mut statuses = Vec::new();
    let transfer = loop {
        let packet = PacketData::parse(game.read_packet().await.unwrap()).unwrap();
        match inspect(&packet, PROTOCOL).unwrap() {
            Inspected::Transfer(t) => break t,
            Inspected::Other(id) => statuses.push(id),
            Inspected::RequestNetworkSettings(_) => unreachable!(),
        }
    };
    assert_eq!(transfer.address, "5678");
    // LoginSuccess plus the spawn status that shared a batch with the Transfer
    assert_eq!(statuses.len(), 2);
}

#[tokio::test]
async fn test_account_mismatch_never_dials_upstream() {
    let h = harness().await;
    h.service.join("play.example.net", 19132).await;

    let tunnel = through_ingress(&h.network).await;
    let game = dial_tunnel(&h.signaling, &tunnel).await;

    match game_login(&game, "9999", PROTOCOL).await {
        Err(LoginError::Disconnected(message)) => assert_eq!(message, "Error: Account mismatch"),
        other => panic!("expected disconnect, got {:?}", other),
    }

    let dialed = tokio::time::timeout(Duration::from_millis(100), h.play.accept()).await;
    assert!(dialed.is_err(), "upstream must not be dialed");
}

#[tokio::test]
async fn test_outdated_client_in_tunnel_is_disconnected() {
    let h = harness().await;
    h.service.join("play.example.net", 19132).await;

    let tunnel = through_ingress(&h.network).await;
    let game = dial_tunnel(&h.signaling, &tunnel).await;

    match game_login(&game, XUID, 800).await {
        Err(LoginError::Disconnected(message)) => {
            assert_eq!(message, "NetherLink requires Minecraft 1.21.90 or newer.")
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_upstream_reports_error() {
    let h = harness().await;
    h.service.join("play.example.net", 19132).await;
    h.play.close().await;

    let tunnel = through_ingress(&h.network).await;
    let game = dial_tunnel(&h.signaling, &tunnel).await;

    match game_login(&game, XUID, PROTOCOL).await {
        Err(LoginError::Disconnected(message)) => {
            assert!(message.starts_with("Error: Failed to connect to 203.0.113.5:19132"))
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
}
