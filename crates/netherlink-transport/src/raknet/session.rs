//! Connected RakNet session
//!
//! Every session runs one driver task that owns its [`ReliabilityLayer`].
//! The driver is fed raw datagrams by whoever reads the UDP socket (the
//! listener's receive loop or the dialer's) and writes to the socket itself.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::reliability::{decode_acks, ReliabilityLayer, FLAG_ACK, FLAG_NACK, FLAG_VALID};
use super::wire::Control;
use crate::{PacketConn, TransportError, TransportResult};

const TICK: Duration = Duration::from_millis(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);
/// Silence after which the peer is considered gone
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a closing session keeps resending unacknowledged frames
const CLOSE_LINGER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub(crate) enum Role {
    Server,
    Client { client_guid: i64 },
}

pub(crate) struct SessionParams {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
    pub mtu: u16,
    pub role: Role,
}

/// Start the driver for a session whose offline handshake is done
///
/// The returned receiver fires once the connection handshake completes.
pub(crate) fn spawn(
    params: SessionParams,
    datagrams: mpsc::Receiver<Bytes>,
    on_exit: impl FnOnce() + Send + 'static,
) -> (RakNetConn, oneshot::Receiver<()>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (established_tx, established_rx) = oneshot::channel();
    let cancel = CancellationToken::new();

    let conn = RakNetConn {
        connection_id: format!("raknet-{}", uuid::Uuid::new_v4()),
        remote_addr: params.peer,
        outbound: outbound_tx,
        inbound: Mutex::new(inbound_rx),
        closed: AtomicBool::new(false),
        cancel: cancel.clone(),
    };

    let driver = Driver {
        connection_id: conn.connection_id.clone(),
        layer: ReliabilityLayer::new(params.mtu),
        socket: params.socket,
        peer: params.peer,
        role: params.role,
        started: Instant::now(),
        last_received: Instant::now(),
        established: Some(established_tx),
        inbound: inbound_tx,
    };
    tokio::spawn(async move {
        driver.run(datagrams, outbound_rx, cancel).await;
        on_exit();
    });

    (conn, established_rx)
}

enum Flow {
    Continue,
    /// The peer sent a disconnect notification
    Closed,
}

struct Driver {
    connection_id: String,
    layer: ReliabilityLayer,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    role: Role,
    started: Instant,
    last_received: Instant,
    established: Option<oneshot::Sender<()>>,
    inbound: mpsc::UnboundedSender<Bytes>,
}

impl Driver {
    fn clock(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    async fn run(
        mut self,
        mut datagrams: mpsc::Receiver<Bytes>,
        mut outbound: mpsc::UnboundedReceiver<Bytes>,
        cancel: CancellationToken,
    ) {
        if let Role::Client { client_guid } = self.role {
            let request = Control::ConnectionRequest {
                client_guid,
                time: self.clock(),
            };
            self.layer.send_ordered(request.encode());
        }

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_ping = Instant::now();

        let closed_locally = loop {
            tokio::select! {
                _ = cancel.cancelled() => break true,
                datagram = datagrams.recv() => match datagram {
                    Some(datagram) => match self.handle_datagram(&datagram) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Closed) => {
                            debug!("[{}] {} disconnected", self.connection_id, self.peer);
                            break false;
                        }
                        Err(e) => {
                            debug!("[{}] Dropping session with {}: {}", self.connection_id, self.peer, e);
                            break false;
                        }
                    },
                    None => break false,
                },
                message = outbound.recv() => match message {
                    Some(message) => self.layer.send_ordered(message),
                    // Connection handle dropped without close
                    None => break true,
                },
                _ = tick.tick() => {
                    if self.last_received.elapsed() >= SESSION_TIMEOUT {
                        debug!("[{}] Session with {} timed out", self.connection_id, self.peer);
                        break false;
                    }
                    if last_ping.elapsed() >= KEEPALIVE_INTERVAL {
                        last_ping = Instant::now();
                        let ping = Control::ConnectedPing { time: self.clock() };
                        self.layer.send_unreliable(ping.encode());
                    }
                }
            }
            self.flush().await;
        };

        if closed_locally {
            // Anything the application queued before closing goes out first
            while let Ok(message) = outbound.try_recv() {
                self.layer.send_ordered(message);
            }
            self.layer.send_ordered(Control::Disconnect.encode());
            self.flush().await;
            self.linger(&mut datagrams, &mut tick).await;
        }
        debug!("[{}] Session with {} ended", self.connection_id, self.peer);
    }

    /// Keep resending until the peer acknowledged everything or the linger expires
    async fn linger(&mut self, datagrams: &mut mpsc::Receiver<Bytes>, tick: &mut tokio::time::Interval) {
        let deadline = Instant::now() + CLOSE_LINGER;
        while self.layer.has_unacked() && Instant::now() < deadline {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                datagram = datagrams.recv() => match datagram {
                    Some(datagram) => {
                        if !matches!(self.handle_datagram(&datagram), Ok(Flow::Continue)) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {}
            }
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        for datagram in self.layer.flush(Instant::now()) {
            if let Err(e) = self.socket.send_to(&datagram, self.peer).await {
                trace!("[{}] Send to {} failed: {}", self.connection_id, self.peer, e);
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8]) -> TransportResult<Flow> {
        let Some(&flags) = datagram.first() else {
            return Ok(Flow::Continue);
        };
        if flags & FLAG_VALID == 0 {
            return Ok(Flow::Continue);
        }
        self.last_received = Instant::now();

        if flags & FLAG_ACK != 0 {
            self.layer.on_ack(&decode_acks(datagram)?);
            return Ok(Flow::Continue);
        }
        if flags & FLAG_NACK != 0 {
            self.layer.on_nack(&decode_acks(datagram)?);
            return Ok(Flow::Continue);
        }

        for message in self.layer.receive(datagram)? {
            if let Flow::Closed = self.handle_message(message) {
                return Ok(Flow::Closed);
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_message(&mut self, message: Bytes) -> Flow {
        let control = match Control::decode(&message) {
            Ok(control) => control,
            Err(e) => {
                trace!("[{}] Ignoring malformed control message: {}", self.connection_id, e);
                return Flow::Continue;
            }
        };

        match (control, self.role) {
            (None, _) => {
                if self.established.is_none() {
                    // The application may already have dropped its handle
                    let _ = self.inbound.send(message);
                }
            }
            (Some(Control::ConnectedPing { time }), _) => {
                let pong = Control::ConnectedPong {
                    ping_time: time,
                    pong_time: self.clock(),
                };
                self.layer.send_unreliable(pong.encode());
            }
            (Some(Control::ConnectionRequest { time, .. }), Role::Server) => {
                let accepted = Control::ConnectionRequestAccepted {
                    client_address: self.peer,
                    request_time: time,
                    accepted_time: self.clock(),
                };
                self.layer.send_ordered(accepted.encode());
            }
            (Some(Control::NewIncomingConnection { .. }), Role::Server) => self.establish(),
            (
                Some(Control::ConnectionRequestAccepted {
                    accepted_time, ..
                }),
                Role::Client { .. },
            ) => {
                let incoming = Control::NewIncomingConnection {
                    server_address: self.peer,
                    request_time: accepted_time,
                    accepted_time: self.clock(),
                };
                self.layer.send_ordered(incoming.encode());
                self.establish();
            }
            (Some(Control::Disconnect), _) => return Flow::Closed,
            (Some(other), _) => trace!("[{}] Ignoring {:?}", self.connection_id, other),
        }
        Flow::Continue
    }

    fn establish(&mut self) {
        if let Some(established) = self.established.take() {
            debug!("[{}] Connected to {}", self.connection_id, self.peer);
            let _ = established.send(());
        }
    }
}

/// An established RakNet connection carrying game batches
pub struct RakNetConn {
    connection_id: String,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RakNetConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RakNetConn")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[async_trait]
impl PacketConn for RakNetConn {
    async fn read_packet(&self) -> TransportResult<Bytes> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut inbound = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::ConnectionClosed),
            guard = self.inbound.lock() => guard,
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::ConnectionClosed),
            message = inbound.recv() => match message {
                Some(message) => Ok(message),
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    self.cancel.cancel();
                    Err(TransportError::ConnectionClosed)
                }
            },
        }
    }

    async fn write_packet(&self, data: &[u8]) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[{}] Closing connection to {}", self.connection_id, self.remote_addr);
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.to_string()
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}
