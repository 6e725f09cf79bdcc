//! Length-delimited TCP transport
//!
//! Each frame is a `u32` big-endian length followed by the batch bytes. Used
//! by the TCP signaling rendezvous and for relaying between processes in
//! development; game clients and servers speak RakNet instead.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Dialer, PacketConn, PacketListener, TransportError, TransportResult, MAX_FRAME_SIZE};

const BIND_ATTEMPTS: u32 = 3;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Framed TCP connection
pub struct TcpPacketConn {
    connection_id: String,
    remote_addr: SocketAddr,
    reader: Mutex<FramedRead<OwnedReadHalf, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TcpPacketConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPacketConn")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl TcpPacketConn {
    pub fn new(stream: TcpStream) -> TransportResult<Self> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            connection_id: format!("tcp-{}", uuid::Uuid::new_v4()),
            remote_addr,
            reader: Mutex::new(FramedRead::new(read_half, codec())),
            writer: Mutex::new(FramedWrite::new(write_half, codec())),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl PacketConn for TcpPacketConn {
    async fn read_packet(&self) -> TransportResult<Bytes> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut reader = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::ConnectionClosed),
            guard = self.reader.lock() => guard,
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::ConnectionClosed),
            frame = reader.next() => match frame {
                Some(Ok(frame)) => Ok(frame.freeze()),
                Some(Err(e)) => Err(e.into()),
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

        let mut writer = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::ConnectionClosed),
            guard = self.writer.lock() => guard,
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::ConnectionClosed),
            result = writer.send(Bytes::copy_from_slice(data)) => result.map_err(Into::into),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[{}] Closing connection to {}", self.connection_id, self.remote_addr);
        self.cancel.cancel();

        // Pending writes bail out on the token, so the lock is released promptly
        let mut writer = self.writer.lock().await;
        let _ = writer.get_mut().shutdown().await;
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

/// Framed TCP listener
pub struct TcpPacketListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TcpPacketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPacketListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl TcpPacketListener {
    /// Bind, retrying a few times while the port is still in TIME_WAIT
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let mut attempt = 1;
        let listener = loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                    warn!(
                        "Port {} is in use (attempt {}/{}), retrying in 1 second...",
                        addr.port(),
                        attempt,
                        BIND_ATTEMPTS
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let local_addr = listener.local_addr()?;
        info!("Listening for packet connections on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            cancel: CancellationToken::new(),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept a raw stream, for transports that add their own preamble
    pub(crate) async fn accept_stream(&self) -> TransportResult<(TcpStream, SocketAddr)> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::ListenerClosed),
            result = self.listener.accept() => Ok(result?),
        }
    }
}

#[async_trait]
impl PacketListener for TcpPacketListener {
    async fn accept(&self) -> TransportResult<Box<dyn PacketConn>> {
        let (stream, peer_addr) = self.accept_stream().await?;
        debug!("Accepted packet connection from {}", peer_addr);
        Ok(Box::new(TcpPacketConn::new(stream)?))
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

/// Dials framed TCP connections
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> TransportResult<Box<dyn PacketConn>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout)??;
        debug!("Dialed {}", address);
        Ok(Box::new(TcpPacketConn::new(stream)?))
    }
}
