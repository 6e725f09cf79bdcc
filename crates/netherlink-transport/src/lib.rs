//! Packet transports for the relay
//!
//! The relay talks to three kinds of peers: the game client on the loopback
//! ingress, the same client arriving again through the peer tunnel, and the
//! upstream server. All of them are modelled as message-oriented duplex
//! connections carrying whole batches, so the relay logic does not care
//! which transport a connection came from.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    netherlink-relay                      │
//! │        (ingress, relay engine, tunnel manager)           │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │          netherlink-transport (this crate)               │
//! │  - PacketConn       - PacketListener                     │
//! │  - Dialer           - Signaling                          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌────────────┬────────────┬────────────┬────────────┬────────────┐
//! │ raknet     │ tcp        │ signaling  │ memory     │ header     │
//! │ (game      │ (framed,   │ (TCP       │ (in-proc,  │ (peer 0xFE │
//! │  clients,  │  dev only) │  rendezv.) │  tests)    │  adapter)  │
//! │  servers)  │            │            │            │            │
//! └────────────┴────────────┴────────────┴────────────┴────────────┘
//! ```
//!
//! Closing a connection is the only cancellation primitive: `close` wakes any
//! task blocked in `read_packet` on the same connection.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use thiserror::Error;

pub mod header;
pub mod memory;
pub mod raknet;
pub mod route;
pub mod signaling;
pub mod tcp;

pub use header::HeaderedConn;
pub use memory::{MemoryConn, MemoryListener, MemoryNetwork, MemorySignaling};
pub use raknet::{RakNetConn, RakNetDialer, RakNetListener};
pub use route::{RouteTable, RoutedListener};
pub use signaling::TcpSignaling;
pub use tcp::{TcpDialer, TcpPacketConn, TcpPacketListener};

/// Largest frame accepted by the framed transports (matches the batch limit)
pub const MAX_FRAME_SIZE: usize = netherlink_proto::MAX_DECOMPRESSED_SIZE;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Signaling error: {0}")]
    SignalingError(String),
}

impl TransportError {
    /// Whether this error only reports an orderly close
    pub fn is_closed(&self) -> bool {
        match self {
            TransportError::ConnectionClosed | TransportError::ListenerClosed => true,
            TransportError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A message-oriented duplex connection
///
/// One call to `write_packet` is delivered as exactly one `read_packet` on the
/// other side. Reads and writes may run concurrently from different tasks.
#[async_trait]
pub trait PacketConn: Send + Sync + Debug {
    /// Receive the next frame
    ///
    /// Returns [`TransportError::ConnectionClosed`] once either side closed.
    async fn read_packet(&self) -> TransportResult<Bytes>;

    /// Send one frame
    async fn write_packet(&self, data: &[u8]) -> TransportResult<()>;

    /// Close the connection and wake pending readers
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Printable remote address (socket address or tunnel id)
    fn remote_addr(&self) -> String;

    /// Stable identifier for log correlation
    fn connection_id(&self) -> String;
}

/// Server side: accepts incoming packet connections
#[async_trait]
pub trait PacketListener: Send + Sync + Debug {
    async fn accept(&self) -> TransportResult<Box<dyn PacketConn>>;

    fn local_addr(&self) -> String;

    /// Stop accepting; a pending `accept` returns [`TransportError::ListenerClosed`]
    async fn close(&self);
}

/// Client side: establishes outgoing packet connections
#[async_trait]
pub trait Dialer: Send + Sync + Debug {
    async fn dial(&self, address: &str) -> TransportResult<Box<dyn PacketConn>>;
}

/// Rendezvous service that makes a tunnel id reachable by peers
#[async_trait]
pub trait Signaling: Send + Sync + Debug {
    /// Publish `tunnel_id` and return a listener for peers dialing it
    async fn publish(&self, tunnel_id: u64, token: &str) -> TransportResult<Box<dyn PacketListener>>;
}
