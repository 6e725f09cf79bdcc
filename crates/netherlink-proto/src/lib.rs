//! NetherLink Protocol Definitions
//!
//! This crate defines the wire-level pieces the relay needs: batch framing,
//! the handful of packets the proxy injects or inspects, the version shim that
//! encodes them for older clients, the login request model, RakNet offline
//! messages and the status (pong) payload format.
//!
//! Everything here is synchronous and allocation-light; transports and the
//! relay state machine live in `netherlink-transport` and `netherlink-relay`.

pub mod codec;
pub mod format;
pub mod framer;
pub mod login;
pub mod packets;
pub mod raknet;
pub mod servers;
pub mod shim;
pub mod status;

pub use codec::{CodecError, PacketReader, PacketWriter};
pub use format::{parse_formatted, strip_formatting, TextSpan, TextStyle};
pub use framer::{
    BatchDecoder, BatchEncoder, CipherPair, Compression, FrameCipher, FramerError, PacketData,
    PacketHeader,
};
pub use login::{ClientData, IdentityData, LoginRequest};
pub use packets::*;
pub use raknet::{UnconnectedPing, UnconnectedPong};
pub use servers::{featured_servers, ServerEntry};
pub use shim::{encode_packet, inspect, Inspected};
pub use status::{ServerStatus, StatusError};

/// Protocol version spoken natively by the relay
pub const CURRENT_PROTOCOL: i32 = 827;

/// Human-readable game version matching [`CURRENT_PROTOCOL`]
pub const CURRENT_VERSION: &str = "1.21.100";

/// Oldest client protocol the relay accepts (1.21.90)
pub const MIN_PROTOCOL: i32 = 818;

/// Human-readable game version matching [`MIN_PROTOCOL`]
pub const MIN_VERSION: &str = "1.21.90";

/// First byte of every game batch on datagram transports
pub const BATCH_HEADER: u8 = 0xfe;

/// Maximum number of packets accepted in a single batch
pub const MAX_BATCH_PACKETS: usize = 812;

/// Default upper bound for a decompressed batch (8MB)
pub const MAX_DECOMPRESSED_SIZE: usize = 8 * 1024 * 1024;
