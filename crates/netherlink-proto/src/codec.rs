//! Primitive readers and writers for game packet bodies
//!
//! Packet bodies mix little-endian fixed-width integers, a few big-endian
//! fields, zig-zag varints and `varuint32` length-prefixed strings. Both the
//! reader and the writer carry the protocol version of the peer so packet
//! definitions can gate fields on it.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of packet: needed {needed} more byte(s)")]
    UnexpectedEof { needed: usize },

    #[error("Varint exceeds {0} bits")]
    VarIntOverflow(u32),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Length {0} exceeds remaining packet size")]
    LengthOutOfBounds(usize),

    #[error("Unexpected packet id: expected {expected:#x}, got {actual:#x}")]
    UnexpectedPacket { expected: u32, actual: u32 },
}

/// Cursor over a packet body
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
    protocol: i32,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8], protocol: i32) -> Self {
        Self {
            buf,
            pos: 0,
            protocol,
        }
    }

    /// Protocol version of the peer that produced this packet
    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Unread part of the buffer
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16_le(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i32_le(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn i32_be(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub fn i64_le(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn f32_le(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn varuint32(&mut self) -> Result<u32, CodecError> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let b = self.u8()?;
            value |= ((b & 0x7f) as u32) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarIntOverflow(32))
    }

    pub fn varint32(&mut self) -> Result<i32, CodecError> {
        let raw = self.varuint32()?;
        Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
    }

    pub fn varuint64(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        for i in 0..10 {
            let b = self.u8()?;
            value |= ((b & 0x7f) as u64) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarIntOverflow(64))
    }

    pub fn varint64(&mut self) -> Result<i64, CodecError> {
        let raw = self.varuint64()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    /// `varuint32` length-prefixed byte slice
    pub fn byte_slice(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.varuint32()? as usize;
        if len > self.remaining() {
            return Err(CodecError::LengthOutOfBounds(len));
        }
        self.take(len)
    }

    /// `varuint32` length-prefixed UTF-8 string
    pub fn string(&mut self) -> Result<String, CodecError> {
        let raw = self.byte_slice()?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    /// `i32` little-endian length-prefixed byte slice (used inside login requests)
    pub fn i32_le_slice(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.i32_le()?;
        let len = usize::try_from(len).map_err(|_| CodecError::LengthOutOfBounds(0))?;
        if len > self.remaining() {
            return Err(CodecError::LengthOutOfBounds(len));
        }
        self.take(len)
    }
}

/// Growable packet body writer
#[derive(Debug)]
pub struct PacketWriter {
    buf: BytesMut,
    protocol: i32,
}

impl PacketWriter {
    pub fn new(protocol: i32) -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
            protocol,
        }
    }

    /// Protocol version of the peer this packet is written for
    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn u16_le(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn i16_le(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn i32_le(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn i32_be(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn u32_le(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn i64_le(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn u64_le(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn f32_le(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn varuint32(&mut self, mut v: u32) {
        while v >= 0x80 {
            self.buf.put_u8((v as u8) | 0x80);
            v >>= 7;
        }
        self.buf.put_u8(v as u8);
    }

    pub fn varint32(&mut self, v: i32) {
        self.varuint32(((v << 1) ^ (v >> 31)) as u32);
    }

    pub fn varuint64(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buf.put_u8((v as u8) | 0x80);
            v >>= 7;
        }
        self.buf.put_u8(v as u8);
    }

    pub fn varint64(&mut self, v: i64) {
        self.varuint64(((v << 1) ^ (v >> 63)) as u64);
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    pub fn byte_slice(&mut self, v: &[u8]) {
        self.varuint32(v.len() as u32);
        self.buf.put_slice(v);
    }

    pub fn string(&mut self, v: &str) {
        self.byte_slice(v.as_bytes());
    }

    pub fn i32_le_slice(&mut self, v: &[u8]) {
        self.i32_le(v.len() as i32);
        self.buf.put_slice(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varuint32_multi_byte() {
        let mut w = PacketWriter::new(0);
        w.varuint32(300);
        let bytes = w.freeze();
        assert_eq!(&bytes[..], &[0xac, 0x02]);

        let mut r = PacketReader::new(&bytes, 0);
        assert_eq!(r.varuint32().unwrap(), 300);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_varint32_zigzag() {
        let mut w = PacketWriter::new(0);
        w.varint32(-1);
        w.varint32(1);
        w.varint32(i32::MIN);
        let bytes = w.freeze();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0x02);

        let mut r = PacketReader::new(&bytes, 0);
        assert_eq!(r.varint32().unwrap(), -1);
        assert_eq!(r.varint32().unwrap(), 1);
        assert_eq!(r.varint32().unwrap(), i32::MIN);
    }

    #[test]
    fn test_varuint32_overflow() {
        let data = [0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        let mut r = PacketReader::new(&data, 0);
        assert_eq!(r.varuint32(), Err(CodecError::VarIntOverflow(32)));
    }

    #[test]
    fn test_string_length_out_of_bounds() {
        let data = [0x05, b'a', b'b'];
        let mut r = PacketReader::new(&data, 0);
        assert_eq!(r.string(), Err(CodecError::LengthOutOfBounds(5)));
    }

    #[test]
    fn test_truncated_fixed_width() {
        let data = [0x01, 0x02];
        let mut r = PacketReader::new(&data, 0);
        assert_eq!(r.i32_be(), Err(CodecError::UnexpectedEof { needed: 2 }));
    }

    #[test]
    fn test_big_endian_i32() {
        let mut w = PacketWriter::new(0);
        w.i32_be(818);
        let bytes = w.freeze();
        assert_eq!(&bytes[..], &[0x00, 0x00, 0x03, 0x32]);
    }
}
