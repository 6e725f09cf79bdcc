//! RakNet offline messages used for status and latency probes

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::CodecError;

pub const ID_UNCONNECTED_PING: u8 = 0x01;
pub const ID_UNCONNECTED_PONG: u8 = 0x1c;

/// Offline message magic
pub const MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

fn need(buf: &[u8], n: usize) -> Result<(), CodecError> {
    if buf.len() < n {
        return Err(CodecError::UnexpectedEof {
            needed: n - buf.len(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnconnectedPing {
    /// Sender clock in milliseconds, echoed back in the pong
    pub send_timestamp: i64,
    pub client_guid: i64,
}

impl UnconnectedPing {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(33);
        buf.put_u8(ID_UNCONNECTED_PING);
        buf.put_i64(self.send_timestamp);
        buf.put_slice(&MAGIC);
        buf.put_i64(self.client_guid);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        need(data, 33)?;
        let id = data.get_u8();
        if id != ID_UNCONNECTED_PING {
            return Err(CodecError::UnexpectedPacket {
                expected: ID_UNCONNECTED_PING as u32,
                actual: id as u32,
            });
        }
        let send_timestamp = data.get_i64();
        data.advance(MAGIC.len());
        let client_guid = data.get_i64();
        Ok(Self {
            send_timestamp,
            client_guid,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPong {
    pub send_timestamp: i64,
    pub server_guid: i64,
    /// Status payload, see [`crate::status`]
    pub data: Bytes,
}

impl UnconnectedPong {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(35 + self.data.len());
        buf.put_u8(ID_UNCONNECTED_PONG);
        buf.put_i64(self.send_timestamp);
        buf.put_i64(self.server_guid);
        buf.put_slice(&MAGIC);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        need(data, 35)?;
        let id = data.get_u8();
        if id != ID_UNCONNECTED_PONG {
            return Err(CodecError::UnexpectedPacket {
                expected: ID_UNCONNECTED_PONG as u32,
                actual: id as u32,
            });
        }
        let send_timestamp = data.get_i64();
        let server_guid = data.get_i64();
        data.advance(MAGIC.len());
        let len = data.get_u16() as usize;
        if len > data.remaining() {
            return Err(CodecError::LengthOutOfBounds(len));
        }
        Ok(Self {
            send_timestamp,
            server_guid,
            data: Bytes::copy_from_slice(&data[..len]),
        })
    }
}
