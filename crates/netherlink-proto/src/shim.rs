//! Version shim for synthetic packets
//!
//! The relay only ever builds a handful of packets itself. [`encode_packet`]
//! writes them with the layout expected by the peer's protocol, and
//! [`inspect`] classifies raw frames from either side by header so the relay
//! can pass everything else through untouched.

use bytes::Bytes;

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::framer::{PacketData, PacketHeader};
use crate::packets::{Decode, Packet, RequestNetworkSettings, Transfer};

/// Disconnect gained a reason code
pub const PROTOCOL_DISCONNECT_REASON: i32 = 622;

/// Disconnect gained a filtered message
pub const PROTOCOL_DISCONNECT_FILTERED_MESSAGE: i32 = 712;

/// Transfer gained the reload world flag
pub const PROTOCOL_TRANSFER_RELOAD_WORLD: i32 = 729;

/// StartGame movement settings lost the movement type field
pub const PROTOCOL_MOVEMENT_TYPE_REMOVED: i32 = 818;

/// Encode a packet (header included) for a peer speaking `protocol`
pub fn encode_packet<P: Packet>(pk: &P, protocol: i32) -> Bytes {
    let mut w = PacketWriter::new(protocol);
    PacketHeader::new(P::ID).write(&mut w);
    pk.write(&mut w);
    w.freeze()
}

/// Decode a packet body, checking the header id first
pub fn decode_packet<P: Decode>(packet: &[u8], protocol: i32) -> Result<P, CodecError> {
    let mut r = PacketReader::new(packet, protocol);
    let header = PacketHeader::read(&mut r)?;
    if header.packet_id != P::ID {
        return Err(CodecError::UnexpectedPacket {
            expected: P::ID,
            actual: header.packet_id,
        });
    }
    P::read(&mut r)
}

/// Result of classifying a frame at the relay boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Inspected {
    Transfer(Transfer),
    RequestNetworkSettings(RequestNetworkSettings),
    /// Anything else, relayed as opaque bytes
    Other(u32),
}

impl Inspected {
    pub fn packet_id(&self) -> u32 {
        match self {
            Inspected::Transfer(_) => Transfer::ID,
            Inspected::RequestNetworkSettings(_) => RequestNetworkSettings::ID,
            Inspected::Other(id) => *id,
        }
    }
}

/// Classify a packet by header, decoding the body only for inspected ids
pub fn inspect(packet: &PacketData, protocol: i32) -> Result<Inspected, CodecError> {
    let mut r = PacketReader::new(packet.payload(), protocol);
    match packet.header().packet_id {
        Transfer::ID => Ok(Inspected::Transfer(Transfer::read(&mut r)?)),
        RequestNetworkSettings::ID => Ok(Inspected::RequestNetworkSettings(
            RequestNetworkSettings::read(&mut r)?,
        )),
        id => Ok(Inspected::Other(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{Disconnect, ID_PLAY_STATUS};

    #[test]
    fn test_transfer_reload_world_gate() {
        let pk = Transfer {
            address: "a".into(),
            port: 19132,
            reload_world: true,
        };
        let current = encode_packet(&pk, 818);
        let legacy = encode_packet(&pk, 728);
        assert_eq!(current.len(), legacy.len() + 1);

        let decoded: Transfer = decode_packet(&legacy, 728).unwrap();
        assert_eq!(decoded.address, "a");
        assert_eq!(decoded.port, 19132);
        assert!(!decoded.reload_world);
    }

    #[test]
    fn test_disconnect_gates() {
        let pk = Disconnect::with_message("bye");
        // header + bool + string
        assert_eq!(encode_packet(&pk, 600).len(), 1 + 1 + 4);
        // + reason
        assert_eq!(encode_packet(&pk, 700).len(), 1 + 1 + 1 + 4);
        // + filtered message
        assert_eq!(encode_packet(&pk, 818).len(), 1 + 1 + 1 + 4 + 1);

        let decoded: Disconnect = decode_packet(&encode_packet(&pk, 700), 700).unwrap();
        assert_eq!(decoded.message, "bye");
    }

    #[test]
    fn test_inspect_transfer() {
        let raw = encode_packet(&Transfer::to_tunnel(5678), 818);
        let packet = PacketData::parse(raw).unwrap();
        match inspect(&packet, 818).unwrap() {
            Inspected::Transfer(t) => assert_eq!(t.address, "5678"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inspect_request_network_settings() {
        let raw = encode_packet(&RequestNetworkSettings { client_protocol: 827 }, 0);
        let packet = PacketData::parse(raw).unwrap();
        assert_eq!(
            inspect(&packet, 0).unwrap(),
            Inspected::RequestNetworkSettings(RequestNetworkSettings { client_protocol: 827 })
        );
    }

    #[test]
    fn test_inspect_other_is_not_decoded() {
        // Truncated body would fail to decode, but PlayStatus is never inspected
        let packet = PacketData::parse(Bytes::from_static(&[ID_PLAY_STATUS as u8, 0x00])).unwrap();
        assert_eq!(inspect(&packet, 818).unwrap(), Inspected::Other(ID_PLAY_STATUS));
    }

    #[test]
    fn test_decode_packet_rejects_wrong_id() {
        let raw = encode_packet(&Disconnect::default(), 818);
        let err = decode_packet::<Transfer>(&raw, 818).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedPacket {
                expected: 0x55,
                actual: 0x05
            }
        );
    }
}
