//! Batch-level connection wrapper with both login roles
//!
//! [`ProxyConnection`] sits on top of any [`PacketConn`] and owns the batch
//! codec state (compression, encryption) plus the protocol version of the
//! peer. It can run the server half of a login (for clients arriving on the
//! ingress or through a tunnel) and the client half (towards the upstream
//! server).

use bytes::Bytes;
use netherlink_proto::login::JwtError;
use netherlink_proto::packets::{disconnect_reason, play_status, Decode, Packet};
use netherlink_proto::shim::decode_packet;
use netherlink_proto::{
    encode_packet, inspect, BatchDecoder, BatchEncoder, CipherPair, ClientData,
    ClientToServerHandshake, CodecError, Compression, Disconnect, FramerError, Inspected, Login,
    LoginRequest, NetworkSettings, PacketData, PacketReader, PlayStatus, RequestNetworkSettings,
    ServerToClientHandshake, CURRENT_PROTOCOL,
};
use netherlink_transport::{PacketConn, TransportError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::RelayConfig;
use crate::session::{Session, SessionError, VerifiedLogin};

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Batch error: {0}")]
    Framer(#[from] FramerError),

    #[error("Packet error: {0}")]
    Codec(#[from] CodecError),
}

impl ConnError {
    /// Whether this error only reports an orderly close
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnError::Transport(e) if e.is_closed())
    }
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error("Client protocol {protocol} is older than {min_version}")]
    UnsupportedProtocol { protocol: i32, min_version: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid login request: {0}")]
    Request(#[from] JwtError),

    #[error("Disconnected by server: {0}")]
    Disconnected(String),

    #[error("Login rejected with status {0}")]
    Rejected(i32),

    #[error("Unsupported compression algorithm {0}")]
    UnsupportedCompression(u16),

    #[error("Login timed out")]
    Timeout,
}

impl From<CodecError> for LoginError {
    fn from(e: CodecError) -> Self {
        LoginError::Conn(ConnError::Codec(e))
    }
}

impl From<TransportError> for LoginError {
    fn from(e: TransportError) -> Self {
        LoginError::Conn(ConnError::Transport(e))
    }
}

struct Inbound {
    decoder: BatchDecoder,
    pending: VecDeque<Bytes>,
}

pub struct ProxyConnection {
    conn: Box<dyn PacketConn>,
    inbound: Mutex<Inbound>,
    encoder: Mutex<BatchEncoder>,
    protocol: AtomicI32,
}

impl std::fmt::Debug for ProxyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConnection")
            .field("conn", &self.conn)
            .field("protocol", &self.protocol())
            .finish()
    }
}

impl ProxyConnection {
    pub fn new(conn: Box<dyn PacketConn>, max_decompressed: usize) -> Self {
        Self {
            conn,
            inbound: Mutex::new(Inbound {
                decoder: BatchDecoder::new().with_max_decompressed(max_decompressed),
                pending: VecDeque::new(),
            }),
            encoder: Mutex::new(BatchEncoder::new()),
            protocol: AtomicI32::new(CURRENT_PROTOCOL),
        }
    }

    pub fn protocol(&self) -> i32 {
        self.protocol.load(Ordering::SeqCst)
    }

    pub fn set_protocol(&self, protocol: i32) {
        self.protocol.store(protocol, Ordering::SeqCst);
    }

    pub fn remote_addr(&self) -> String {
        self.conn.remote_addr()
    }

    pub fn connection_id(&self) -> String {
        self.conn.connection_id()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// Read the next batch, or whatever is still queued from an earlier one
    pub async fn read_packets(&self) -> Result<Vec<Bytes>, ConnError> {
        let mut inbound = self.inbound.lock().await;
        if !inbound.pending.is_empty() {
            return Ok(inbound.pending.drain(..).collect());
        }
        loop {
            let frame = self.conn.read_packet().await?;
            let packets = inbound.decoder.decode(&frame)?;
            if !packets.is_empty() {
                trace!("[{}] Read batch of {}", self.conn.connection_id(), packets.len());
                return Ok(packets);
            }
        }
    }

    /// Read a single packet, queueing the rest of its batch
    pub async fn read_packet(&self) -> Result<Bytes, ConnError> {
        let mut inbound = self.inbound.lock().await;
        loop {
            if let Some(packet) = inbound.pending.pop_front() {
                return Ok(packet);
            }
            let frame = self.conn.read_packet().await?;
            let packets = inbound.decoder.decode(&frame)?;
            inbound.pending.extend(packets);
        }
    }

    /// Put a packet back so the next read returns it first
    pub async fn unread(&self, packet: Bytes) {
        self.inbound.lock().await.pending.push_front(packet);
    }

    pub async fn write_packets(&self, packets: &[Bytes]) -> Result<(), ConnError> {
        if packets.is_empty() {
            return Ok(());
        }
        let batch = self.encoder.lock().await.encode(packets)?;
        self.conn.write_packet(&batch).await?;
        Ok(())
    }

    /// Encode `pk` for this peer's protocol and send it in its own batch
    pub async fn write_packet<P: Packet>(&self, pk: &P) -> Result<(), ConnError> {
        let packet = encode_packet(pk, self.protocol());
        self.write_packets(&[packet]).await
    }

    pub async fn enable_compression(&self, compression: Compression) {
        self.inbound.lock().await.decoder.enable_compression(compression);
        self.encoder.lock().await.enable_compression(compression);
    }

    pub async fn enable_encryption(&self, ciphers: CipherPair) {
        self.inbound.lock().await.decoder.enable_encryption(ciphers.inbound);
        self.encoder.lock().await.enable_encryption(ciphers.outbound);
    }

    /// Send a Disconnect with a visible message
    pub async fn disconnect(&self, message: impl Into<String>) -> Result<(), ConnError> {
        self.write_packet(&Disconnect::with_message(message)).await
    }

    /// Server role: wait for RequestNetworkSettings and answer it
    ///
    /// Clients below the configured floor get a Disconnect and an error.
    /// Otherwise flate compression is enabled in both directions and the
    /// client protocol is returned.
    pub async fn negotiate(&self, config: &RelayConfig) -> Result<i32, LoginError> {
        let request = loop {
            let packet = PacketData::parse(self.read_packet().await?)?;
            match inspect(&packet, self.protocol())? {
                Inspected::RequestNetworkSettings(request) => break request,
                other => {
                    trace!("Ignoring packet {:#x} before network settings", other.packet_id())
                }
            }
        };

        let protocol = request.client_protocol;
        self.set_protocol(protocol);
        debug!("[{}] Client requested protocol {}", self.connection_id(), protocol);

        if protocol < config.min_protocol {
            self.write_packet(&Disconnect {
                reason: disconnect_reason::OUTDATED_CLIENT,
                message: config.outdated_client_message(),
                ..Default::default()
            })
            .await?;
            return Err(LoginError::UnsupportedProtocol {
                protocol,
                min_version: config.min_version.clone(),
            });
        }

        self.write_packet(&NetworkSettings {
            compression_algorithm: Compression::Flate.network_id(),
            ..Default::default()
        })
        .await?;
        self.enable_compression(Compression::Flate).await;
        Ok(protocol)
    }

    /// Server role: full login of an inbound peer
    pub async fn accept_login(
        &self,
        session: &dyn Session,
        config: &RelayConfig,
    ) -> Result<VerifiedLogin, LoginError> {
        self.negotiate(config).await?;

        let login: Login = loop {
            let packet = self.read_packet().await?;
            match decode_packet::<Login>(&packet, self.protocol()) {
                Ok(login) => break login,
                Err(CodecError::UnexpectedPacket { actual, .. }) => {
                    trace!("Ignoring packet {:#x} before login", actual)
                }
                Err(e) => return Err(e.into()),
            }
        };

        let request = LoginRequest::from_packet(&login)?;
        let mut verified = session.verify_login(&request).await?;

        if let Some(handshake) = verified.handshake.take() {
            self.write_packet(&ServerToClientHandshake { jwt: handshake.jwt })
                .await?;
            self.enable_encryption(handshake.ciphers).await;
            self.expect::<ClientToServerHandshake>().await?;
            debug!("[{}] Encryption enabled", self.connection_id());
        }

        Ok(verified)
    }

    /// Client role: log in to an upstream server as the session's account
    ///
    /// A LoginSuccess status is left queued so the relay forwards it to the
    /// client.
    pub async fn login(
        &self,
        client_data: &ClientData,
        session: &dyn Session,
        protocol: i32,
    ) -> Result<(), LoginError> {
        self.set_protocol(protocol);
        self.write_packet(&RequestNetworkSettings {
            client_protocol: protocol,
        })
        .await?;

        loop {
            let raw = self.read_packet().await?;
            let packet = PacketData::parse(raw)?;
            let mut r = PacketReader::new(packet.payload(), protocol);
            match packet.header().packet_id {
                NetworkSettings::ID => {
                    let settings = NetworkSettings::read(&mut r)?;
                    let compression = Compression::from_network_id(settings.compression_algorithm)
                        .ok_or(LoginError::UnsupportedCompression(
                            settings.compression_algorithm,
                        ))?;
                    self.enable_compression(compression).await;
                    break;
                }
                Disconnect::ID => {
                    let disconnect = Disconnect::read(&mut r)?;
                    return Err(LoginError::Disconnected(disconnect.message));
                }
                PlayStatus::ID => {
                    let status = PlayStatus::read(&mut r)?;
                    return Err(LoginError::Rejected(status.status));
                }
                _ => {}
            }
        }

        let auth = session.multiplayer_authorization().await?;
        let client_data_jwt = auth.signer.sign_client_data(client_data)?;
        let request = LoginRequest::new(auth.chain, client_data_jwt);
        self.write_packet(&request.into_packet(protocol)?).await?;

        loop {
            let raw = self.read_packet().await?;
            let packet = PacketData::parse(raw.clone())?;
            let mut r = PacketReader::new(packet.payload(), protocol);
            match packet.header().packet_id {
                ServerToClientHandshake::ID => {
                    let handshake = ServerToClientHandshake::read(&mut r)?;
                    let ciphers = auth.signer.accept_handshake(&handshake.jwt)?;
                    self.enable_encryption(ciphers).await;
                    self.write_packet(&ClientToServerHandshake).await?;
                    debug!("[{}] Upstream encryption enabled", self.connection_id());
                    return Ok(());
                }
                PlayStatus::ID => {
                    let status = PlayStatus::read(&mut r)?;
                    if status.status != play_status::LOGIN_SUCCESS {
                        return Err(LoginError::Rejected(status.status));
                    }
                    self.unread(raw).await;
                    return Ok(());
                }
                Disconnect::ID => {
                    let disconnect = Disconnect::read(&mut r)?;
                    return Err(LoginError::Disconnected(disconnect.message));
                }
                _ => {}
            }
        }
    }

    /// Read packets until one of type `P`, dropping others
    async fn expect<P: Decode>(&self) -> Result<P, LoginError> {
        loop {
            let packet = self.read_packet().await?;
            match decode_packet::<P>(&packet, self.protocol()) {
                Ok(pk) => return Ok(pk),
                Err(CodecError::UnexpectedPacket { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
