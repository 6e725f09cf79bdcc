//! RakNet transport
//!
//! The game client and Bedrock servers speak RakNet over UDP. This module
//! implements the parts of it a relay needs: the offline handshake,
//! reliable-ordered delivery with ACK/NACK and resends, split messages,
//! keepalive pings and disconnect notifications. Unconnected pings are
//! answered by [`RakNetListener`] when it has a pong payload.
//!
//! Everything is sent on order channel 0; RakNet security is not supported
//! (Bedrock encrypts at the batch layer instead).

pub mod dialer;
pub mod listener;
pub mod reliability;
pub mod session;
pub mod wire;

pub use dialer::RakNetDialer;
pub use listener::RakNetListener;
pub use session::RakNetConn;

/// RakNet protocol version spoken by Bedrock
pub const RAKNET_PROTOCOL: u8 = 11;

/// IPv4 + UDP header bytes counted in the negotiated MTU
pub const UDP_HEADER_SIZE: usize = 28;

/// Frame set header: flags and a 24-bit sequence number
pub const DATAGRAM_HEADER_SIZE: usize = 4;

pub const MIN_MTU: u16 = 576;
pub const MAX_MTU: u16 = 1492;

/// Frame sets buffered per session before the receive loop drops them
const DATAGRAM_QUEUE: usize = 1024;

fn clamp_mtu(mtu: u16) -> u16 {
    mtu.clamp(MIN_MTU, MAX_MTU)
}
