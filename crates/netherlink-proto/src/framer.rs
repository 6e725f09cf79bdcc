//! Batch framing for both relay directions
//!
//! A batch is the unit carried by a single transport packet:
//!
//! ```text
//! 0xFE | [cipher( [compression prefix] | packets )]
//! packets = ( varuint32 length | header | payload )*
//! ```
//!
//! Compression is only present once network settings have been exchanged,
//! and the cipher only after the login handshake. Both are enabled on the
//! encoder and decoder independently since each direction switches over at a
//! different point of the handshake.

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::{BATCH_HEADER, MAX_BATCH_PACKETS, MAX_DECOMPRESSED_SIZE};
use bytes::Bytes;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::{Read, Write};
use thiserror::Error;

/// Framing errors
#[derive(Debug, Error)]
pub enum FramerError {
    #[error("Empty batch")]
    EmptyBatch,

    #[error("Invalid batch header {0:#04x}")]
    InvalidHeader(u8),

    #[error("Unsupported compression algorithm {0:#04x}")]
    UnsupportedCompression(u8),

    #[error("Decompressed batch exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Batch holds more than {0} packets")]
    TooManyPackets(usize),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Malformed batch: {0}")]
    Codec(#[from] CodecError),
}

/// Header preceding every packet inside a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_id: u32,
    pub sender_sub_client: u8,
    pub target_sub_client: u8,
}

impl PacketHeader {
    pub fn new(packet_id: u32) -> Self {
        Self {
            packet_id,
            sender_sub_client: 0,
            target_sub_client: 0,
        }
    }

    pub fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let raw = r.varuint32()?;
        Ok(Self {
            packet_id: raw & 0x3ff,
            sender_sub_client: ((raw >> 10) & 0x3) as u8,
            target_sub_client: ((raw >> 12) & 0x3) as u8,
        })
    }

    pub fn write(&self, w: &mut PacketWriter) {
        w.varuint32(
            self.packet_id
                | ((self.sender_sub_client as u32) << 10)
                | ((self.target_sub_client as u32) << 12),
        );
    }
}

/// A single packet with its header decoded eagerly and the payload left opaque
#[derive(Debug, Clone)]
pub struct PacketData {
    header: PacketHeader,
    full: Bytes,
    payload_offset: usize,
}

impl PacketData {
    pub fn parse(full: Bytes) -> Result<Self, CodecError> {
        let mut r = PacketReader::new(&full, 0);
        let header = PacketHeader::read(&mut r)?;
        let payload_offset = full.len() - r.remaining();
        Ok(Self {
            header,
            full,
            payload_offset,
        })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.full[self.payload_offset..]
    }
}

/// Batch compression algorithm negotiated through network settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Flate,
    None,
}

impl Compression {
    /// Algorithm id carried in the NetworkSettings packet
    pub fn network_id(&self) -> u16 {
        match self {
            Compression::Flate => 0,
            Compression::None => 0xffff,
        }
    }

    pub fn from_network_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(Compression::Flate),
            0xffff => Some(Compression::None),
            _ => None,
        }
    }

    /// Per-batch prefix byte
    pub fn prefix(&self) -> u8 {
        match self {
            Compression::Flate => 0x00,
            Compression::None => 0xff,
        }
    }
}

/// Stream cipher applied to everything after the batch header
///
/// Key agreement belongs to the identity collaborator; the framer only
/// applies the resulting cipher.
pub trait FrameCipher: Send + Sync {
    fn seal(&mut self, data: &mut Vec<u8>);

    fn open(&mut self, data: &mut Vec<u8>) -> Result<(), FramerError>;
}

/// Directional ciphers produced by a completed encryption handshake
pub struct CipherPair {
    pub outbound: Box<dyn FrameCipher>,
    pub inbound: Box<dyn FrameCipher>,
}

impl std::fmt::Debug for CipherPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherPair").finish_non_exhaustive()
    }
}

/// Encodes outgoing packets into batches
#[derive(Default)]
pub struct BatchEncoder {
    compression: Option<Compression>,
    cipher: Option<Box<dyn FrameCipher>>,
}

impl BatchEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_compression(&mut self, compression: Compression) {
        self.compression = Some(compression);
    }

    pub fn enable_encryption(&mut self, cipher: Box<dyn FrameCipher>) {
        self.cipher = Some(cipher);
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    pub fn encode(&mut self, packets: &[Bytes]) -> Result<Bytes, FramerError> {
        let mut w = PacketWriter::new(0);
        for packet in packets {
            w.byte_slice(packet);
        }
        let packed = w.freeze();

        let mut body = match self.compression {
            Some(Compression::Flate) => {
                let mut encoder = DeflateEncoder::new(
                    Vec::with_capacity(packed.len() / 2 + 1),
                    flate2::Compression::default(),
                );
                encoder.write_all(&packed)?;
                let mut compressed = encoder.finish()?;
                compressed.insert(0, Compression::Flate.prefix());
                compressed
            }
            Some(Compression::None) => {
                let mut raw = Vec::with_capacity(packed.len() + 1);
                raw.push(Compression::None.prefix());
                raw.extend_from_slice(&packed);
                raw
            }
            None => packed.to_vec(),
        };

        if let Some(cipher) = self.cipher.as_mut() {
            cipher.seal(&mut body);
        }

        let mut batch = Vec::with_capacity(body.len() + 1);
        batch.push(BATCH_HEADER);
        batch.extend_from_slice(&body);
        Ok(Bytes::from(batch))
    }
}

impl std::fmt::Debug for BatchEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEncoder")
            .field("compression", &self.compression)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

/// Decodes incoming batches into individual packets
pub struct BatchDecoder {
    compression: Option<Compression>,
    cipher: Option<Box<dyn FrameCipher>>,
    max_decompressed: usize,
}

impl Default for BatchDecoder {
    fn default() -> Self {
        Self {
            compression: None,
            cipher: None,
            max_decompressed: MAX_DECOMPRESSED_SIZE,
        }
    }
}

impl BatchDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_decompressed(mut self, limit: usize) -> Self {
        self.max_decompressed = limit;
        self
    }

    pub fn enable_compression(&mut self, compression: Compression) {
        self.compression = Some(compression);
    }

    pub fn enable_encryption(&mut self, cipher: Box<dyn FrameCipher>) {
        self.cipher = Some(cipher);
    }

    pub fn decode(&mut self, batch: &[u8]) -> Result<Vec<Bytes>, FramerError> {
        let (&first, rest) = batch.split_first().ok_or(FramerError::EmptyBatch)?;
        if first != BATCH_HEADER {
            return Err(FramerError::InvalidHeader(first));
        }
        let mut body = rest.to_vec();

        if let Some(cipher) = self.cipher.as_mut() {
            cipher.open(&mut body)?;
        }

        if self.compression.is_some() {
            let (&prefix, compressed) = body.split_first().ok_or(FramerError::EmptyBatch)?;
            body = match prefix {
                0x00 => self.inflate(compressed)?,
                0xff => compressed.to_vec(),
                other => return Err(FramerError::UnsupportedCompression(other)),
            };
        }

        let mut r = PacketReader::new(&body, 0);
        let mut packets = Vec::new();
        while r.remaining() > 0 {
            if packets.len() == MAX_BATCH_PACKETS {
                return Err(FramerError::TooManyPackets(MAX_BATCH_PACKETS));
            }
            packets.push(Bytes::copy_from_slice(r.byte_slice()?));
        }
        Ok(packets)
    }

    fn inflate(&self, data: &[u8]) -> Result<Vec<u8>, FramerError> {
        let mut out = Vec::with_capacity(data.len() * 2);
        DeflateDecoder::new(data)
            .take(self.max_decompressed as u64 + 1)
            .read_to_end(&mut out)?;
        if out.len() > self.max_decompressed {
            return Err(FramerError::TooLarge(self.max_decompressed));
        }
        Ok(out)
    }
}

impl std::fmt::Debug for BatchDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDecoder")
            .field("compression", &self.compression)
            .field("encrypted", &self.cipher.is_some())
            .field("max_decompressed", &self.max_decompressed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// XOR "cipher" so the framing order can be observed
    struct XorCipher(u8);

    impl FrameCipher for XorCipher {
        fn seal(&mut self, data: &mut Vec<u8>) {
            data.iter_mut().for_each(|b| *b ^= self.0);
        }

        fn open(&mut self, data: &mut Vec<u8>) -> Result<(), FramerError> {
            data.iter_mut().for_each(|b| *b ^= self.0);
            Ok(())
        }
    }

    fn packet(id: u32, payload: &[u8]) -> Bytes {
        let mut w = PacketWriter::new(0);
        PacketHeader::new(id).write(&mut w);
        w.bytes(payload);
        w.freeze()
    }

    #[test]
    fn test_header_sub_client_bits() {
        let mut w = PacketWriter::new(0);
        PacketHeader {
            packet_id: 0x55,
            sender_sub_client: 1,
            target_sub_client: 2,
        }
        .write(&mut w);
        let bytes = w.freeze();

        let data = PacketData::parse(bytes).unwrap();
        assert_eq!(data.header().packet_id, 0x55);
        assert_eq!(data.header().sender_sub_client, 1);
        assert_eq!(data.header().target_sub_client, 2);
        assert!(data.payload().is_empty());
    }

    #[test]
    fn test_uncompressed_batch_layout() {
        let mut encoder = BatchEncoder::new();
        let batch = encoder.encode(&[packet(0xc1, &[0, 0, 3, 0x32])]).unwrap();
        assert_eq!(&batch[..], &[0xfe, 0x06, 0xc1, 0x01, 0, 0, 3, 0x32]);

        let mut decoder = BatchDecoder::new();
        let packets = decoder.decode(&batch).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(PacketData::parse(packets[0].clone()).unwrap().header().packet_id, 0xc1);
    }

    #[test]
    fn test_flate_batch_with_cipher() {
        let mut encoder = BatchEncoder::new();
        encoder.enable_compression(Compression::Flate);
        encoder.enable_encryption(Box::new(XorCipher(0x5a)));

        let packets = vec![packet(0x0b, &[1; 512]), packet(0x55, b"hello")];
        let batch = encoder.encode(&packets).unwrap();
        assert_eq!(batch[0], BATCH_HEADER);
        assert_eq!(batch[1] ^ 0x5a, Compression::Flate.prefix());

        let mut decoder = BatchDecoder::new();
        decoder.enable_compression(Compression::Flate);
        decoder.enable_encryption(Box::new(XorCipher(0x5a)));
        assert_eq!(decoder.decode(&batch).unwrap(), packets);
    }

    #[test]
    fn test_decoder_accepts_uncompressed_prefix() {
        let mut encoder = BatchEncoder::new();
        encoder.enable_compression(Compression::None);
        let batch = encoder.encode(&[packet(0x05, b"bye")]).unwrap();
        assert_eq!(batch[1], 0xff);

        let mut decoder = BatchDecoder::new();
        decoder.enable_compression(Compression::Flate);
        assert_eq!(decoder.decode(&batch).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut decoder = BatchDecoder::new();
        assert!(matches!(
            decoder.decode(&[0x01, 0x00]),
            Err(FramerError::InvalidHeader(0x01))
        ));
        assert!(matches!(decoder.decode(&[]), Err(FramerError::EmptyBatch)));
    }

    #[test]
    fn test_snappy_prefix_unsupported() {
        let mut decoder = BatchDecoder::new();
        decoder.enable_compression(Compression::Flate);
        assert!(matches!(
            decoder.decode(&[0xfe, 0x01, 0x00]),
            Err(FramerError::UnsupportedCompression(0x01))
        ));
    }

    #[test]
    fn test_decompression_limit() {
        let mut encoder = BatchEncoder::new();
        encoder.enable_compression(Compression::Flate);
        let batch = encoder.encode(&[packet(0x0b, &[0; 4096])]).unwrap();

        let mut decoder = BatchDecoder::new().with_max_decompressed(1024);
        decoder.enable_compression(Compression::Flate);
        assert!(matches!(
            decoder.decode(&batch),
            Err(FramerError::TooLarge(1024))
        ));
    }

    #[test]
    fn test_too_many_packets() {
        let mut encoder = BatchEncoder::new();
        let packets: Vec<Bytes> = (0..=MAX_BATCH_PACKETS).map(|_| packet(0x00, &[])).collect();
        let batch = encoder.encode(&packets).unwrap();

        let mut decoder = BatchDecoder::new();
        assert!(matches!(
            decoder.decode(&batch),
            Err(FramerError::TooManyPackets(_))
        ));
    }

    #[test]
    fn test_compression_network_ids() {
        assert_eq!(Compression::from_network_id(0), Some(Compression::Flate));
        assert_eq!(Compression::from_network_id(0xffff), Some(Compression::None));
        assert_eq!(Compression::from_network_id(1), None);
    }
}
