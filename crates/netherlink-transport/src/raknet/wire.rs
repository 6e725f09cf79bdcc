//! RakNet handshake and control messages

use bytes::{BufMut, Bytes, BytesMut};
use netherlink_proto::raknet::MAGIC;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

use crate::{TransportError, TransportResult};

pub const ID_CONNECTED_PING: u8 = 0x00;
pub const ID_UNCONNECTED_PING: u8 = 0x01;
pub const ID_UNCONNECTED_PING_OPEN: u8 = 0x02;
pub const ID_CONNECTED_PONG: u8 = 0x03;
pub const ID_OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
pub const ID_OPEN_CONNECTION_REPLY_1: u8 = 0x06;
pub const ID_OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
pub const ID_OPEN_CONNECTION_REPLY_2: u8 = 0x08;
pub const ID_CONNECTION_REQUEST: u8 = 0x09;
pub const ID_CONNECTION_REQUEST_ACCEPTED: u8 = 0x10;
pub const ID_NEW_INCOMING_CONNECTION: u8 = 0x13;
pub const ID_DISCONNECTION_NOTIFICATION: u8 = 0x15;
pub const ID_INCOMPATIBLE_PROTOCOL_VERSION: u8 = 0x19;

/// System addresses carried by the connection handshake
const SYSTEM_ADDRESSES: usize = 20;

/// Windows `AF_INET6`, which every Bedrock peer writes
const AF_INET6: u16 = 23;

fn short(what: &str) -> TransportError {
    TransportError::ProtocolError(format!("truncated {}", what))
}

/// Bounds-checked reader over a received datagram
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn take(&mut self, n: usize) -> TransportResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(short("message"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> TransportResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_be(&mut self) -> TransportResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u16_le(&mut self) -> TransportResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u24_le(&mut self) -> TransportResult<u32> {
        let b = self.take(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn u32_be(&mut self) -> TransportResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i64_be(&mut self) -> TransportResult<i64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn magic(&mut self) -> TransportResult<()> {
        if self.take(MAGIC.len())? != MAGIC {
            return Err(TransportError::ProtocolError(
                "bad offline message magic".to_string(),
            ));
        }
        Ok(())
    }

    pub fn address(&mut self) -> TransportResult<SocketAddr> {
        match self.u8()? {
            4 => {
                let b = self.take(4)?;
                let ip = Ipv4Addr::new(!b[0], !b[1], !b[2], !b[3]);
                let port = self.u16_be()?;
                Ok(SocketAddr::new(IpAddr::V4(ip), port))
            }
            6 => {
                let _family = self.u16_le()?;
                let port = self.u16_be()?;
                let flowinfo = self.u32_be()?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.take(16)?);
                let scope_id = self.u32_be()?;
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                )))
            }
            other => Err(TransportError::ProtocolError(format!(
                "unknown address version {}",
                other
            ))),
        }
    }
}

pub(crate) fn put_u24_le(buf: &mut BytesMut, value: u32) {
    buf.put_slice(&value.to_le_bytes()[..3]);
}

pub(crate) fn put_address(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(4);
            for octet in v4.ip().octets() {
                buf.put_u8(!octet);
            }
            buf.put_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_u16_le(AF_INET6);
            buf.put_u16(v6.port());
            buf.put_u32(v6.flowinfo());
            buf.put_slice(&v6.ip().octets());
            buf.put_u32(v6.scope_id());
        }
    }
}

fn system_addresses(buf: &mut BytesMut) {
    let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    put_address(buf, &SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
    for _ in 1..SYSTEM_ADDRESSES {
        put_address(buf, &unspecified);
    }
}

/// Skip the system address list; its length differs between implementations
fn skip_system_addresses(cursor: &mut Cursor<'_>) -> TransportResult<()> {
    while cursor.remaining() > 16 {
        cursor.address()?;
    }
    Ok(())
}

fn offline(id: u8, capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(capacity);
    buf.put_u8(id);
    buf.put_slice(&MAGIC);
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionRequest1 {
    pub protocol: u8,
    /// Path MTU probed by the padding, including IP and UDP headers
    pub mtu: u16,
}

impl OpenConnectionRequest1 {
    pub fn encode(&self) -> Bytes {
        let len = (self.mtu as usize).saturating_sub(super::UDP_HEADER_SIZE);
        let mut buf = offline(ID_OPEN_CONNECTION_REQUEST_1, len);
        buf.put_u8(self.protocol);
        buf.resize(len.max(buf.len()), 0);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> TransportResult<Self> {
        let mut cursor = Cursor::new(data);
        cursor.u8()?;
        cursor.magic()?;
        let protocol = cursor.u8()?;
        let mtu = (data.len() + super::UDP_HEADER_SIZE).min(u16::MAX as usize) as u16;
        Ok(Self { protocol, mtu })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionReply1 {
    pub server_guid: i64,
    pub mtu: u16,
}

impl OpenConnectionReply1 {
    pub fn encode(&self) -> Bytes {
        let mut buf = offline(ID_OPEN_CONNECTION_REPLY_1, 28);
        buf.put_i64(self.server_guid);
        buf.put_u8(0);
        buf.put_u16(self.mtu);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> TransportResult<Self> {
        let mut cursor = Cursor::new(data);
        cursor.u8()?;
        cursor.magic()?;
        let server_guid = cursor.i64_be()?;
        if cursor.u8()? != 0 {
            return Err(TransportError::ProtocolError(
                "server requires RakNet security".to_string(),
            ));
        }
        let mtu = cursor.u16_be()?;
        Ok(Self { server_guid, mtu })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionRequest2 {
    pub server_address: SocketAddr,
    pub mtu: u16,
    pub client_guid: i64,
}

impl OpenConnectionRequest2 {
    pub fn encode(&self) -> Bytes {
        let mut buf = offline(ID_OPEN_CONNECTION_REQUEST_2, 64);
        put_address(&mut buf, &self.server_address);
        buf.put_u16(self.mtu);
        buf.put_i64(self.client_guid);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> TransportResult<Self> {
        let mut cursor = Cursor::new(data);
        cursor.u8()?;
        cursor.magic()?;
        let server_address = cursor.address()?;
        let mtu = cursor.u16_be()?;
        let client_guid = cursor.i64_be()?;
        Ok(Self {
            server_address,
            mtu,
            client_guid,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionReply2 {
    pub server_guid: i64,
    pub client_address: SocketAddr,
    pub mtu: u16,
}

impl OpenConnectionReply2 {
    pub fn encode(&self) -> Bytes {
        let mut buf = offline(ID_OPEN_CONNECTION_REPLY_2, 64);
        buf.put_i64(self.server_guid);
        put_address(&mut buf, &self.client_address);
        buf.put_u16(self.mtu);
        buf.put_u8(0);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> TransportResult<Self> {
        let mut cursor = Cursor::new(data);
        cursor.u8()?;
        cursor.magic()?;
        let server_guid = cursor.i64_be()?;
        let client_address = cursor.address()?;
        let mtu = cursor.u16_be()?;
        Ok(Self {
            server_guid,
            client_address,
            mtu,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncompatibleProtocolVersion {
    pub protocol: u8,
    pub server_guid: i64,
}

impl IncompatibleProtocolVersion {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(26);
        buf.put_u8(ID_INCOMPATIBLE_PROTOCOL_VERSION);
        buf.put_u8(self.protocol);
        buf.put_slice(&MAGIC);
        buf.put_i64(self.server_guid);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> TransportResult<Self> {
        let mut cursor = Cursor::new(data);
        cursor.u8()?;
        let protocol = cursor.u8()?;
        cursor.magic()?;
        let server_guid = cursor.i64_be()?;
        Ok(Self {
            protocol,
            server_guid,
        })
    }
}

/// Messages exchanged inside an established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    ConnectedPing {
        time: i64,
    },
    ConnectedPong {
        ping_time: i64,
        pong_time: i64,
    },
    ConnectionRequest {
        client_guid: i64,
        time: i64,
    },
    ConnectionRequestAccepted {
        client_address: SocketAddr,
        request_time: i64,
        accepted_time: i64,
    },
    NewIncomingConnection {
        server_address: SocketAddr,
        request_time: i64,
        accepted_time: i64,
    },
    Disconnect,
}

impl Control {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            Control::ConnectedPing { time } => {
                buf.put_u8(ID_CONNECTED_PING);
                buf.put_i64(*time);
            }
            Control::ConnectedPong {
                ping_time,
                pong_time,
            } => {
                buf.put_u8(ID_CONNECTED_PONG);
                buf.put_i64(*ping_time);
                buf.put_i64(*pong_time);
            }
            Control::ConnectionRequest { client_guid, time } => {
                buf.put_u8(ID_CONNECTION_REQUEST);
                buf.put_i64(*client_guid);
                buf.put_i64(*time);
                buf.put_u8(0);
            }
            Control::ConnectionRequestAccepted {
                client_address,
                request_time,
                accepted_time,
            } => {
                buf.put_u8(ID_CONNECTION_REQUEST_ACCEPTED);
                put_address(&mut buf, client_address);
                buf.put_u16(0);
                system_addresses(&mut buf);
                buf.put_i64(*request_time);
                buf.put_i64(*accepted_time);
            }
            Control::NewIncomingConnection {
                server_address,
                request_time,
                accepted_time,
            } => {
                buf.put_u8(ID_NEW_INCOMING_CONNECTION);
                put_address(&mut buf, server_address);
                system_addresses(&mut buf);
                buf.put_i64(*request_time);
                buf.put_i64(*accepted_time);
            }
            Control::Disconnect => buf.put_u8(ID_DISCONNECTION_NOTIFICATION),
        }
        buf.freeze()
    }

    /// Decode a control message; `None` for anything else (game batches)
    pub fn decode(data: &[u8]) -> TransportResult<Option<Self>> {
        let mut cursor = Cursor::new(data);
        let Ok(id) = cursor.u8() else {
            return Ok(None);
        };
        let control = match id {
            ID_CONNECTED_PING => Control::ConnectedPing {
                time: cursor.i64_be()?,
            },
            ID_CONNECTED_PONG => Control::ConnectedPong {
                ping_time: cursor.i64_be()?,
                pong_time: cursor.i64_be()?,
            },
            ID_CONNECTION_REQUEST => Control::ConnectionRequest {
                client_guid: cursor.i64_be()?,
                time: cursor.i64_be()?,
            },
            ID_CONNECTION_REQUEST_ACCEPTED => {
                let client_address = cursor.address()?;
                cursor.u16_be()?;
                skip_system_addresses(&mut cursor)?;
                Control::ConnectionRequestAccepted {
                    client_address,
                    request_time: cursor.i64_be()?,
                    accepted_time: cursor.i64_be()?,
                }
            }
            ID_NEW_INCOMING_CONNECTION => {
                let server_address = cursor.address()?;
                skip_system_addresses(&mut cursor)?;
                Control::NewIncomingConnection {
                    server_address,
                    request_time: cursor.i64_be()?,
                    accepted_time: cursor.i64_be()?,
                }
            }
            ID_DISCONNECTION_NOTIFICATION => Control::Disconnect,
            _ => return Ok(None),
        };
        Ok(Some(control))
    }
}
