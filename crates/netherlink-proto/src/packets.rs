//! Packets the relay injects, inspects or needs during login
//!
//! Only this small set is ever decoded or encoded by the proxy; every other
//! packet is carried through as opaque bytes. Field gates on the peer protocol
//! live in [`crate::shim`].

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::shim;

pub const ID_LOGIN: u32 = 0x01;
pub const ID_PLAY_STATUS: u32 = 0x02;
pub const ID_SERVER_TO_CLIENT_HANDSHAKE: u32 = 0x03;
pub const ID_CLIENT_TO_SERVER_HANDSHAKE: u32 = 0x04;
pub const ID_DISCONNECT: u32 = 0x05;
pub const ID_START_GAME: u32 = 0x0b;
pub const ID_TRANSFER: u32 = 0x55;
pub const ID_NETWORK_SETTINGS: u32 = 0x8f;
pub const ID_REQUEST_NETWORK_SETTINGS: u32 = 0xc1;

/// A packet that can be written for a peer of a given protocol
pub trait Packet {
    const ID: u32;

    fn write(&self, w: &mut PacketWriter);
}

/// A packet the relay needs to read back
pub trait Decode: Packet + Sized {
    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError>;
}

/// First packet of every connection, announcing the client protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestNetworkSettings {
    pub client_protocol: i32,
}

impl Packet for RequestNetworkSettings {
    const ID: u32 = ID_REQUEST_NETWORK_SETTINGS;

    fn write(&self, w: &mut PacketWriter) {
        w.i32_be(self.client_protocol);
    }
}

impl Decode for RequestNetworkSettings {
    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            client_protocol: r.i32_be()?,
        })
    }
}

/// Server reply selecting compression for the rest of the connection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSettings {
    pub compression_threshold: u16,
    pub compression_algorithm: u16,
    pub client_throttle: bool,
    pub client_throttle_threshold: u8,
    pub client_throttle_scalar: f32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            compression_threshold: 0,
            compression_algorithm: 0,
            client_throttle: false,
            client_throttle_threshold: 0,
            client_throttle_scalar: 0.0,
        }
    }
}

impl Packet for NetworkSettings {
    const ID: u32 = ID_NETWORK_SETTINGS;

    fn write(&self, w: &mut PacketWriter) {
        w.u16_le(self.compression_threshold);
        w.u16_le(self.compression_algorithm);
        w.bool(self.client_throttle);
        w.u8(self.client_throttle_threshold);
        w.f32_le(self.client_throttle_scalar);
    }
}

impl Decode for NetworkSettings {
    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            compression_threshold: r.u16_le()?,
            compression_algorithm: r.u16_le()?,
            client_throttle: r.bool()?,
            client_throttle_threshold: r.u8()?,
            client_throttle_scalar: r.f32_le()?,
        })
    }
}

/// Login packet carrying the identity chain and client data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub client_protocol: i32,
    pub connection_request: Vec<u8>,
}

impl Packet for Login {
    const ID: u32 = ID_LOGIN;

    fn write(&self, w: &mut PacketWriter) {
        w.i32_be(self.client_protocol);
        w.byte_slice(&self.connection_request);
    }
}

impl Decode for Login {
    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            client_protocol: r.i32_be()?,
            connection_request: r.byte_slice()?.to_vec(),
        })
    }
}

/// PlayStatus values relevant to login
pub mod play_status {
    pub const LOGIN_SUCCESS: i32 = 0;
    pub const LOGIN_FAILED_CLIENT: i32 = 1;
    pub const LOGIN_FAILED_SERVER: i32 = 2;
    pub const PLAYER_SPAWN: i32 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayStatus {
    pub status: i32,
}

impl Packet for PlayStatus {
    const ID: u32 = ID_PLAY_STATUS;

    fn write(&self, w: &mut PacketWriter) {
        w.i32_be(self.status);
    }
}

impl Decode for PlayStatus {
    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            status: r.i32_be()?,
        })
    }
}

/// Server half of the encryption handshake (a signed JWT carrying the salt)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerToClientHandshake {
    pub jwt: Vec<u8>,
}

impl Packet for ServerToClientHandshake {
    const ID: u32 = ID_SERVER_TO_CLIENT_HANDSHAKE;

    fn write(&self, w: &mut PacketWriter) {
        w.byte_slice(&self.jwt);
    }
}

impl Decode for ServerToClientHandshake {
    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            jwt: r.byte_slice()?.to_vec(),
        })
    }
}

/// Client acknowledgement that encryption is enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientToServerHandshake;

impl Packet for ClientToServerHandshake {
    const ID: u32 = ID_CLIENT_TO_SERVER_HANDSHAKE;

    fn write(&self, _w: &mut PacketWriter) {}
}

impl Decode for ClientToServerHandshake {
    fn read(_r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

/// Disconnect reasons used by the relay
pub mod disconnect_reason {
    pub const UNKNOWN: i32 = 0;
    pub const OUTDATED_CLIENT: i32 = 5;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason: i32,
    pub hide_disconnection_screen: bool,
    pub message: String,
    pub filtered_message: String,
}

impl Disconnect {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

impl Packet for Disconnect {
    const ID: u32 = ID_DISCONNECT;

    fn write(&self, w: &mut PacketWriter) {
        if w.protocol() >= shim::PROTOCOL_DISCONNECT_REASON {
            w.varint32(self.reason);
        }
        w.bool(self.hide_disconnection_screen);
        if !self.hide_disconnection_screen {
            w.string(&self.message);
            if w.protocol() >= shim::PROTOCOL_DISCONNECT_FILTERED_MESSAGE {
                w.string(&self.filtered_message);
            }
        }
    }
}

impl Decode for Disconnect {
    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let mut pk = Disconnect::default();
        if r.protocol() >= shim::PROTOCOL_DISCONNECT_REASON {
            pk.reason = r.varint32()?;
        }
        pk.hide_disconnection_screen = r.bool()?;
        if !pk.hide_disconnection_screen {
            pk.message = r.string()?;
            if r.protocol() >= shim::PROTOCOL_DISCONNECT_FILTERED_MESSAGE {
                pk.filtered_message = r.string()?;
            }
        }
        Ok(pk)
    }
}

/// Instructs the receiver to reconnect elsewhere
///
/// When sent to a client over the peer transport the address is a decimal
/// tunnel id rather than a hostname.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transfer {
    pub address: String,
    pub port: u16,
    pub reload_world: bool,
}

impl Transfer {
    pub fn to_tunnel(tunnel_id: u64) -> Self {
        Self {
            address: tunnel_id.to_string(),
            ..Default::default()
        }
    }
}

impl Packet for Transfer {
    const ID: u32 = ID_TRANSFER;

    fn write(&self, w: &mut PacketWriter) {
        w.string(&self.address);
        w.u16_le(self.port);
        if w.protocol() >= shim::PROTOCOL_TRANSFER_RELOAD_WORLD {
            w.bool(self.reload_world);
        }
    }
}

impl Decode for Transfer {
    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let address = r.string()?;
        let port = r.u16_le()?;
        let reload_world = if r.protocol() >= shim::PROTOCOL_TRANSFER_RELOAD_WORLD {
            r.bool()?
        } else {
            false
        };
        Ok(Self {
            address,
            port,
            reload_world,
        })
    }
}

/// Movement settings embedded in StartGame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerMovementSettings {
    /// Only written for clients older than the server-authoritative movement change
    pub legacy_movement_type: i32,
    pub rewind_history_size: i32,
    pub server_authoritative_block_breaking: bool,
}

impl PlayerMovementSettings {
    fn write(&self, w: &mut PacketWriter) {
        if w.protocol() < shim::PROTOCOL_MOVEMENT_TYPE_REMOVED {
            w.varint32(self.legacy_movement_type);
        }
        w.varint32(self.rewind_history_size);
        w.bool(self.server_authoritative_block_breaking);
    }
}

/// Synthetic StartGame sent by the loopback ingress
///
/// The client only has to accept it long enough to process the following
/// Transfer, so every world field is left at its zero value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StartGame {
    pub entity_unique_id: i64,
    pub entity_runtime_id: u64,
    pub player_game_mode: i32,
    pub player_position: [f32; 3],
    pub pitch: f32,
    pub yaw: f32,
    pub world_seed: i64,
    pub dimension: i32,
    pub world_game_mode: i32,
    pub difficulty: i32,
    pub world_spawn: [i32; 3],
    pub base_game_version: String,
    pub level_id: String,
    pub world_name: String,
    pub player_movement_settings: PlayerMovementSettings,
    pub game_version: String,
}

impl Packet for StartGame {
    const ID: u32 = ID_START_GAME;

    fn write(&self, w: &mut PacketWriter) {
        w.varint64(self.entity_unique_id);
        w.varuint64(self.entity_runtime_id);
        w.varint32(self.player_game_mode);
        for v in self.player_position {
            w.f32_le(v);
        }
        w.f32_le(self.pitch);
        w.f32_le(self.yaw);

        // Level settings
        w.i64_le(self.world_seed);
        w.i16_le(0); // spawn biome type
        w.string(""); // user defined biome name
        w.varint32(self.dimension);
        w.varint32(1); // generator: infinite
        w.varint32(self.world_game_mode);
        w.bool(false); // hardcore
        w.varint32(self.difficulty);
        w.varint32(self.world_spawn[0]);
        w.varuint32(self.world_spawn[1] as u32);
        w.varint32(self.world_spawn[2]);
        w.bool(true); // achievements disabled
        w.varint32(0); // editor world type
        w.bool(false); // created in editor
        w.bool(false); // exported from editor
        w.varint32(0); // day cycle lock time
        w.varint32(0); // education edition offer
        w.bool(false); // education features
        w.string(""); // education product id
        w.f32_le(0.0); // rain level
        w.f32_le(0.0); // lightning level
        w.bool(false); // confirmed platform locked content
        w.bool(true); // multiplayer game
        w.bool(false); // LAN broadcast
        w.varint32(0); // XBL broadcast mode
        w.varint32(0); // platform broadcast mode
        w.bool(false); // commands enabled
        w.bool(false); // texture pack required
        w.varuint32(0); // game rules
        w.u32_le(0); // experiments
        w.bool(false); // experiments previously toggled
        w.bool(false); // bonus chest
        w.bool(false); // start with map
        w.varint32(1); // player permissions: member
        w.i32_le(4); // server chunk tick radius
        for _ in 0..9 {
            // locked packs, world template flags, persona and emote toggles
            w.bool(false);
        }
        w.string(&self.base_game_version);
        w.i32_le(16); // limited world width
        w.i32_le(16); // limited world depth
        w.bool(true); // new nether
        w.string(""); // education shared resource button name
        w.string(""); // education shared resource link
        w.bool(false); // force experimental gameplay: absent
        w.u8(0); // chat restriction level
        w.bool(false); // disable player interactions
        w.string(""); // server id
        w.string(""); // world id
        w.string(""); // scenario id
        w.string(""); // owner id

        w.string(&self.level_id);
        w.string(&self.world_name);
        w.string(""); // template content identity
        w.bool(false); // trial
        self.player_movement_settings.write(w);
        w.i64_le(0); // time
        w.varint32(0); // enchantment seed
        w.varuint32(0); // custom blocks
        w.string(""); // multiplayer correlation id
        w.bool(false); // server authoritative inventory
        w.string(&self.game_version);
        w.bytes(&[0x0a, 0x00, 0x00]); // empty network NBT compound
        w.u64_le(0); // server block state checksum
        w.bytes(&[0; 16]); // world template id
        w.bool(false); // client side generation
        w.bool(false); // block network id hashes
        w.bool(false); // server authoritative sound
        w.bool(false); // server join information: absent
        w.string(""); // telemetry server id
        w.string(""); // telemetry scenario id
        w.string(""); // telemetry world id
        w.string(""); // telemetry owner id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write<P: Packet>(pk: &P, protocol: i32) -> Vec<u8> {
        let mut w = PacketWriter::new(protocol);
        pk.write(&mut w);
        w.freeze().to_vec()
    }

    #[test]
    fn test_request_network_settings_is_big_endian() {
        let bytes = write(&RequestNetworkSettings { client_protocol: 818 }, 818);
        assert_eq!(bytes, vec![0x00, 0x00, 0x03, 0x32]);
    }

    #[test]
    fn test_network_settings_layout() {
        let pk = NetworkSettings {
            compression_threshold: 1,
            compression_algorithm: 0,
            ..Default::default()
        };
        let bytes = write(&pk, 818);
        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[..4], &[0x01, 0x00, 0x00, 0x00]);

        let decoded = NetworkSettings::read(&mut PacketReader::new(&bytes, 818)).unwrap();
        assert_eq!(decoded, pk);
    }

    #[test]
    fn test_disconnect_hidden_screen_skips_message() {
        let pk = Disconnect {
            hide_disconnection_screen: true,
            message: "ignored".into(),
            ..Default::default()
        };
        let bytes = write(&pk, 818);
        assert_eq!(bytes, vec![0x00, 0x01]);
    }

    #[test]
    fn test_transfer_to_tunnel_uses_decimal_id() {
        let pk = Transfer::to_tunnel(1234);
        assert_eq!(pk.address, "1234");
        assert_eq!(pk.port, 0);
    }

    #[test]
    fn test_movement_settings_legacy_field() {
        let settings = PlayerMovementSettings {
            legacy_movement_type: 2,
            rewind_history_size: 40,
            server_authoritative_block_breaking: true,
        };

        let mut current = PacketWriter::new(818);
        settings.write(&mut current);
        let mut legacy = PacketWriter::new(800);
        settings.write(&mut legacy);

        assert_eq!(current.len() + 1, legacy.len());
        assert_eq!(legacy.freeze()[0], 0x04);
    }
}
