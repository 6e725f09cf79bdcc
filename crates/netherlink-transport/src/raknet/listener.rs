//! RakNet server socket
//!
//! One receive loop owns the UDP socket. It answers offline messages
//! (unconnected pings and the open-connection handshake) itself and routes
//! frame sets to the session registered for the sender's address.

use async_trait::async_trait;
use bytes::Bytes;
use netherlink_proto::raknet::{UnconnectedPing, UnconnectedPong};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::reliability::FLAG_VALID;
use super::session::{self, RakNetConn, Role, SessionParams};
use super::wire::*;
use super::{clamp_mtu, DATAGRAM_QUEUE, MAX_MTU, RAKNET_PROTOCOL};
use crate::{PacketConn, PacketListener, TransportError, TransportResult};

type Sessions = StdMutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>;

#[derive(Debug)]
struct Shared {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    server_guid: i64,
    /// Status payload for unconnected pongs; `None` leaves pings unanswered
    pong_data: StdRwLock<Option<Bytes>>,
    sessions: Sessions,
}

/// Accepts RakNet connections on one UDP socket
#[derive(Debug)]
pub struct RakNetListener {
    shared: Arc<Shared>,
    accepted: Mutex<mpsc::UnboundedReceiver<RakNetConn>>,
    cancel: CancellationToken,
}

impl RakNetListener {
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("Listening for RakNet connections on {}", local_addr);

        let shared = Arc::new(Shared {
            socket: Arc::new(socket),
            local_addr,
            server_guid: rand::random(),
            pong_data: StdRwLock::new(None),
            sessions: StdMutex::new(HashMap::new()),
        });
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(receive_loop(shared.clone(), accepted_tx, cancel.clone()));

        Ok(Self {
            shared,
            accepted: Mutex::new(accepted_rx),
            cancel,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn server_guid(&self) -> i64 {
        self.shared.server_guid
    }

    /// Answer unconnected pings with `data`, or stop answering with `None`
    pub fn set_pong_data(&self, data: Option<Bytes>) {
        if let Ok(mut pong) = self.shared.pong_data.write() {
            *pong = data;
        }
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Drop for RakNetListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl PacketListener for RakNetListener {
    async fn accept(&self) -> TransportResult<Box<dyn PacketConn>> {
        let mut accepted = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::ListenerClosed),
            guard = self.accepted.lock() => guard,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::ListenerClosed),
            conn = accepted.recv() => match conn {
                Some(conn) => Ok(Box::new(conn)),
                None => Err(TransportError::ListenerClosed),
            },
        }
    }

    fn local_addr(&self) -> String {
        self.shared.local_addr.to_string()
    }

    /// Stop accepting; established sessions keep running until they close
    async fn close(&self) {
        self.cancel.cancel();
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    accepted: mpsc::UnboundedSender<RakNetConn>,
    cancel: CancellationToken,
) {
    let mut accepted = Some(accepted);
    let mut buf = vec![0u8; MAX_MTU as usize];

    loop {
        if accepted.is_none() && shared.session_count() == 0 {
            break;
        }

        let (n, from) = tokio::select! {
            _ = cancel.cancelled(), if accepted.is_some() => {
                accepted = None;
                continue;
            }
            received = shared.socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    trace!("RakNet receive error on {}: {}", shared.local_addr, e);
                    continue;
                }
            },
        };

        let data = &buf[..n];
        let Some(&id) = data.first() else {
            continue;
        };

        if id & FLAG_VALID != 0 {
            shared.route(from, data);
            continue;
        }

        if let Err(e) = shared.handle_offline(id, from, data, accepted.as_ref()).await {
            trace!("Bad offline message 0x{:02x} from {}: {}", id, from, e);
        }
    }
    debug!("RakNet listener on {} stopped", shared.local_addr);
}

impl Shared {
    fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn route(&self, from: SocketAddr, data: &[u8]) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        let Some(session) = sessions.get(&from) else {
            return;
        };
        match session.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("Session queue for {} full, dropping datagram", from),
            Err(TrySendError::Closed(_)) => {
                sessions.remove(&from);
            }
        }
    }

    async fn send(&self, data: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.send_to(data, to).await {
            trace!("RakNet send to {} failed: {}", to, e);
        }
    }

    async fn handle_offline(
        self: &Arc<Self>,
        id: u8,
        from: SocketAddr,
        data: &[u8],
        accepted: Option<&mpsc::UnboundedSender<RakNetConn>>,
    ) -> TransportResult<()> {
        match id {
            ID_UNCONNECTED_PING | ID_UNCONNECTED_PING_OPEN => {
                let pong_data = self.pong_data.read().ok().and_then(|p| p.clone());
                let Some(pong_data) = pong_data else {
                    return Ok(());
                };
                let mut ping = data.to_vec();
                ping[0] = ID_UNCONNECTED_PING;
                let ping = UnconnectedPing::decode(&ping)
                    .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
                let pong = UnconnectedPong {
                    send_timestamp: ping.send_timestamp,
                    server_guid: self.server_guid,
                    data: pong_data,
                };
                self.send(&pong.encode(), from).await;
            }
            ID_OPEN_CONNECTION_REQUEST_1 => {
                if accepted.is_none() {
                    return Ok(());
                }
                let request = OpenConnectionRequest1::decode(data)?;
                if request.protocol != RAKNET_PROTOCOL {
                    debug!(
                        "Rejecting {} speaking RakNet protocol {}",
                        from, request.protocol
                    );
                    let reply = IncompatibleProtocolVersion {
                        protocol: RAKNET_PROTOCOL,
                        server_guid: self.server_guid,
                    };
                    self.send(&reply.encode(), from).await;
                    return Ok(());
                }
                let reply = OpenConnectionReply1 {
                    server_guid: self.server_guid,
                    mtu: clamp_mtu(request.mtu),
                };
                self.send(&reply.encode(), from).await;
            }
            ID_OPEN_CONNECTION_REQUEST_2 => {
                let Some(accepted) = accepted else {
                    return Ok(());
                };
                let request = OpenConnectionRequest2::decode(data)?;
                let mtu = clamp_mtu(request.mtu);
                let reply = OpenConnectionReply2 {
                    server_guid: self.server_guid,
                    client_address: from,
                    mtu,
                };
                self.send(&reply.encode(), from).await;
                self.open_session(from, mtu, accepted.clone());
            }
            _ => trace!("Ignoring offline message 0x{:02x} from {}", id, from),
        }
        Ok(())
    }

    fn open_session(
        self: &Arc<Self>,
        peer: SocketAddr,
        mtu: u16,
        accepted: mpsc::UnboundedSender<RakNetConn>,
    ) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        // A repeated request while the first reply was in flight
        if sessions.contains_key(&peer) {
            return;
        }

        let (datagrams_tx, datagrams_rx) = mpsc::channel(DATAGRAM_QUEUE);
        sessions.insert(peer, datagrams_tx);
        drop(sessions);

        let shared: Weak<Shared> = Arc::downgrade(self);
        let params = SessionParams {
            socket: self.socket.clone(),
            peer,
            mtu,
            role: Role::Server,
        };
        let (conn, established) = session::spawn(params, datagrams_rx, move || {
            if let Some(shared) = shared.upgrade() {
                if let Ok(mut sessions) = shared.sessions.lock() {
                    sessions.remove(&peer);
                }
            }
        });

        debug!("RakNet session with {} opened (MTU {})", peer, mtu);
        tokio::spawn(async move {
            if established.await.is_ok() {
                let _ = accepted.send(conn);
            }
        });
    }
}
