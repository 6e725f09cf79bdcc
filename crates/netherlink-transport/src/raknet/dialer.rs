//! RakNet client side

use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::reliability::FLAG_VALID;
use super::session::{self, RakNetConn, Role, SessionParams};
use super::wire::*;
use super::{clamp_mtu, DATAGRAM_QUEUE, MAX_MTU, RAKNET_PROTOCOL};
use crate::{Dialer, PacketConn, TransportError, TransportResult};

/// MTUs tried in turn while discovering the path MTU
const MTU_CANDIDATES: [u16; 3] = [1492, 1200, 576];
const ATTEMPTS_PER_MTU: u32 = 2;
const REQUEST_2_ATTEMPTS: u32 = 4;
const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Dials RakNet servers
#[derive(Debug, Clone)]
pub struct RakNetDialer {
    connect_timeout: Duration,
}

impl Default for RakNetDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RakNetDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Run the offline and connection handshakes with `address`
    pub async fn connect(&self, address: &str) -> TransportResult<RakNetConn> {
        let peer = tokio::net::lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| {
                TransportError::ConnectionError(format!("no address found for {}", address))
            })?;

        let bind = match peer.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);

        let reply_1 = open_connection_1(&socket, peer).await?;
        let client_guid: i64 = rand::random();
        let request_2 = OpenConnectionRequest2 {
            server_address: peer,
            mtu: clamp_mtu(reply_1.mtu),
            client_guid,
        }
        .encode();

        let mut reply_2 = None;
        for _ in 0..REQUEST_2_ATTEMPTS {
            socket.send_to(&request_2, peer).await?;
            if let Some(data) =
                await_reply(&socket, peer, &[ID_OPEN_CONNECTION_REPLY_2], REPLY_TIMEOUT).await
            {
                reply_2 = Some(OpenConnectionReply2::decode(&data)?);
                break;
            }
        }
        let reply_2 = reply_2.ok_or(TransportError::Timeout)?;
        let mtu = clamp_mtu(reply_2.mtu);

        let (datagrams_tx, datagrams_rx) = mpsc::channel(DATAGRAM_QUEUE);
        let params = SessionParams {
            socket: socket.clone(),
            peer,
            mtu,
            role: Role::Client { client_guid },
        };
        let (conn, established) = session::spawn(params, datagrams_rx, || {});
        tokio::spawn(forward_datagrams(socket, peer, datagrams_tx));

        established.await.map_err(|_| {
            TransportError::ConnectionError(format!("{} did not accept the connection", peer))
        })?;
        debug!("Connected to {} over RakNet (MTU {})", peer, mtu);
        Ok(conn)
    }
}

#[async_trait]
impl Dialer for RakNetDialer {
    async fn dial(&self, address: &str) -> TransportResult<Box<dyn PacketConn>> {
        let conn = tokio::time::timeout(self.connect_timeout, self.connect(address))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(Box::new(conn))
    }
}

/// Try decreasing MTUs until the server answers
async fn open_connection_1(
    socket: &UdpSocket,
    peer: SocketAddr,
) -> TransportResult<OpenConnectionReply1> {
    for mtu in MTU_CANDIDATES {
        let request = OpenConnectionRequest1 {
            protocol: RAKNET_PROTOCOL,
            mtu,
        }
        .encode();

        for _ in 0..ATTEMPTS_PER_MTU {
            socket.send_to(&request, peer).await?;
            let ids = [ID_OPEN_CONNECTION_REPLY_1, ID_INCOMPATIBLE_PROTOCOL_VERSION];
            let Some(data) = await_reply(socket, peer, &ids, REPLY_TIMEOUT).await else {
                continue;
            };
            if data[0] == ID_INCOMPATIBLE_PROTOCOL_VERSION {
                let reply = IncompatibleProtocolVersion::decode(&data)?;
                return Err(TransportError::ProtocolError(format!(
                    "server speaks RakNet protocol {}, not {}",
                    reply.protocol, RAKNET_PROTOCOL
                )));
            }
            return OpenConnectionReply1::decode(&data);
        }
        trace!("No reply from {} at MTU {}", peer, mtu);
    }
    Err(TransportError::Timeout)
}

/// Next datagram from `peer` whose id is in `ids`, if one arrives in time
async fn await_reply(
    socket: &UdpSocket,
    peer: SocketAddr,
    ids: &[u8],
    wait: Duration,
) -> Option<Vec<u8>> {
    let deadline = Instant::now() + wait;
    let mut buf = vec![0u8; MAX_MTU as usize];
    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .ok()?;
        let (n, from) = match received {
            Ok(received) => received,
            Err(e) => {
                trace!("RakNet receive error from {}: {}", peer, e);
                continue;
            }
        };
        if from == peer && n > 0 && ids.contains(&buf[0]) {
            return Some(buf[..n].to_vec());
        }
    }
}

/// Feed frame sets from `peer` to the session until it ends
async fn forward_datagrams(socket: Arc<UdpSocket>, peer: SocketAddr, session: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; MAX_MTU as usize];
    loop {
        let (n, from) = tokio::select! {
            _ = session.closed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    trace!("RakNet receive error from {}: {}", peer, e);
                    continue;
                }
            },
        };
        if from != peer || n == 0 || buf[0] & FLAG_VALID == 0 {
            continue;
        }
        if session.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            break;
        }
    }
}
