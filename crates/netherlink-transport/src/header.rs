//! Batch header adapter for peer tunnel connections
//!
//! Peer transports carry batches without the leading `0xFE` byte that the
//! loopback transport keeps. Wrapping a peer connection in [`HeaderedConn`]
//! lets the relay treat both the same way.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use netherlink_proto::BATCH_HEADER;

use crate::{PacketConn, TransportResult};

#[derive(Debug)]
pub struct HeaderedConn {
    inner: Box<dyn PacketConn>,
}

impl HeaderedConn {
    pub fn new(inner: Box<dyn PacketConn>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl PacketConn for HeaderedConn {
    async fn read_packet(&self) -> TransportResult<Bytes> {
        let frame = self.inner.read_packet().await?;
        let mut buf = BytesMut::with_capacity(frame.len() + 1);
        buf.put_u8(BATCH_HEADER);
        buf.put_slice(&frame);
        Ok(buf.freeze())
    }

    async fn write_packet(&self, data: &[u8]) -> TransportResult<()> {
        match data.split_first() {
            Some((&BATCH_HEADER, rest)) => self.inner.write_packet(rest).await,
            _ => self.inner.write_packet(data).await,
        }
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn remote_addr(&self) -> String {
        self.inner.remote_addr()
    }

    fn connection_id(&self) -> String {
        self.inner.connection_id()
    }
}
