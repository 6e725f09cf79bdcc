//! Frame sets, acknowledgements and the per-session reliability layer
//!
//! [`ReliabilityLayer`] is synchronous: the session task feeds it received
//! datagrams and clock ticks and sends whatever it returns.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::wire::{put_u24_le, Cursor};
use super::{DATAGRAM_HEADER_SIZE, UDP_HEADER_SIZE};
use crate::{TransportError, TransportResult};

pub const FLAG_VALID: u8 = 0x80;
pub const FLAG_ACK: u8 = 0x40;
pub const FLAG_NACK: u8 = 0x20;
const FLAG_NEEDS_B_AND_AS: u8 = 0x04;
const FLAG_SPLIT: u8 = 0x10;

/// Header bytes of a reliable-ordered frame without split info
const FRAME_HEADER_SIZE: usize = 1 + 2 + 3 + 3 + 4;
const SPLIT_HEADER_SIZE: usize = 4 + 2 + 4;

const ORDER_CHANNELS: usize = 32;
/// Most fragments accepted for one message
const MAX_SPLIT_COUNT: u32 = 8192;
/// Most split messages reassembled at once
const MAX_OPEN_SPLITS: usize = 64;
/// Gap beyond which missing datagrams are not NACKed individually
const MAX_NACK_GAP: u32 = 512;
/// Out-of-order messages buffered per channel
const MAX_ORDER_BUFFER: usize = 4096;

pub const RESEND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableWithAck = 5,
    ReliableWithAck = 6,
    ReliableOrderedWithAck = 7,
}

impl Reliability {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Reliability::Unreliable,
            1 => Reliability::UnreliableSequenced,
            2 => Reliability::Reliable,
            3 => Reliability::ReliableOrdered,
            4 => Reliability::ReliableSequenced,
            5 => Reliability::UnreliableWithAck,
            6 => Reliability::ReliableWithAck,
            _ => Reliability::ReliableOrderedWithAck,
        }
    }

    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Reliability::Reliable
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableWithAck
                | Reliability::ReliableOrderedWithAck
        )
    }

    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced | Reliability::ReliableSequenced
        )
    }

    /// Carries an order index and channel
    pub fn is_arranged(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableOrderedWithAck
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub reliability: Reliability,
    pub reliable_index: u32,
    pub sequence_index: u32,
    pub order_index: u32,
    pub order_channel: u8,
    pub split: Option<Split>,
    pub body: Bytes,
}

impl Frame {
    fn unreliable(body: Bytes) -> Self {
        Self {
            reliability: Reliability::Unreliable,
            reliable_index: 0,
            sequence_index: 0,
            order_index: 0,
            order_channel: 0,
            split: None,
            body,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 3 + self.body.len();
        if self.reliability.is_reliable() {
            len += 3;
        }
        if self.reliability.is_sequenced() {
            len += 3;
        }
        if self.reliability.is_arranged() {
            len += 4;
        }
        if self.split.is_some() {
            len += SPLIT_HEADER_SIZE;
        }
        len
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = (self.reliability as u8) << 5;
        if self.split.is_some() {
            flags |= FLAG_SPLIT;
        }
        buf.put_u8(flags);
        buf.put_u16((self.body.len() * 8) as u16);
        if self.reliability.is_reliable() {
            put_u24_le(buf, self.reliable_index);
        }
        if self.reliability.is_sequenced() {
            put_u24_le(buf, self.sequence_index);
        }
        if self.reliability.is_arranged() {
            put_u24_le(buf, self.order_index);
            buf.put_u8(self.order_channel);
        }
        if let Some(split) = self.split {
            buf.put_u32(split.count);
            buf.put_u16(split.id);
            buf.put_u32(split.index);
        }
        buf.put_slice(&self.body);
    }

    fn decode(cursor: &mut Cursor<'_>) -> TransportResult<Self> {
        let flags = cursor.u8()?;
        let reliability = Reliability::from_bits(flags >> 5);
        let bits = cursor.u16_be()? as usize;
        let len = bits.div_ceil(8);

        let mut frame = Frame::unreliable(Bytes::new());
        frame.reliability = reliability;
        if reliability.is_reliable() {
            frame.reliable_index = cursor.u24_le()?;
        }
        if reliability.is_sequenced() {
            frame.sequence_index = cursor.u24_le()?;
        }
        if reliability.is_arranged() {
            frame.order_index = cursor.u24_le()?;
            frame.order_channel = cursor.u8()?;
        }
        if flags & FLAG_SPLIT != 0 {
            frame.split = Some(Split {
                count: cursor.u32_be()?,
                id: cursor.u16_be()?,
                index: cursor.u32_be()?,
            });
        }
        frame.body = Bytes::copy_from_slice(cursor.take(len)?);
        Ok(frame)
    }
}

/// A frame set with its sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub sequence: u32,
    pub frames: Vec<Frame>,
}

impl Datagram {
    pub fn encode(&self) -> Bytes {
        let len = DATAGRAM_HEADER_SIZE + self.frames.iter().map(Frame::encoded_len).sum::<usize>();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(FLAG_VALID | FLAG_NEEDS_B_AND_AS);
        put_u24_le(&mut buf, self.sequence);
        for frame in &self.frames {
            frame.encode(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> TransportResult<Self> {
        let mut cursor = Cursor::new(data);
        cursor.u8()?;
        let sequence = cursor.u24_le()?;
        let mut frames = Vec::new();
        while cursor.remaining() > 0 {
            frames.push(Frame::decode(&mut cursor)?);
        }
        Ok(Self { sequence, frames })
    }
}

/// Encode an ACK or NACK for the given sequence numbers
pub fn encode_acks(flag: u8, sequences: &BTreeSet<u32>) -> Bytes {
    let mut records: Vec<(u32, u32)> = Vec::new();
    for &seq in sequences {
        match records.last_mut() {
            Some((_, end)) if *end + 1 == seq => *end = seq,
            _ => records.push((seq, seq)),
        }
    }

    let mut buf = BytesMut::with_capacity(3 + records.len() * 7);
    buf.put_u8(FLAG_VALID | flag);
    buf.put_u16(records.len() as u16);
    for (start, end) in records {
        if start == end {
            buf.put_u8(1);
            put_u24_le(&mut buf, start);
        } else {
            buf.put_u8(0);
            put_u24_le(&mut buf, start);
            put_u24_le(&mut buf, end);
        }
    }
    buf.freeze()
}

/// Sequence numbers named by an ACK or NACK
pub fn decode_acks(data: &[u8]) -> TransportResult<Vec<u32>> {
    let mut cursor = Cursor::new(data);
    cursor.u8()?;
    let count = cursor.u16_be()?;
    let mut sequences = Vec::new();
    for _ in 0..count {
        let single = cursor.u8()? != 0;
        let start = cursor.u24_le()?;
        let end = if single { start } else { cursor.u24_le()? };
        if end < start || end - start > MAX_NACK_GAP * 8 {
            return Err(TransportError::ProtocolError(format!(
                "bad ack range {}..={}",
                start, end
            )));
        }
        sequences.extend(start..=end);
    }
    Ok(sequences)
}

/// Reliable indices seen so far
#[derive(Debug, Default)]
struct ReceiveWindow {
    lowest: u32,
    above: HashSet<u32>,
}

impl ReceiveWindow {
    /// Record `index`; false if it was already seen
    fn insert(&mut self, index: u32) -> bool {
        if index < self.lowest || !self.above.insert(index) {
            return false;
        }
        while self.above.remove(&self.lowest) {
            self.lowest += 1;
        }
        true
    }
}

#[derive(Debug)]
struct SplitAssembly {
    parts: Vec<Option<Bytes>>,
    received: usize,
}

#[derive(Debug)]
struct InFlight {
    frames: Vec<Frame>,
    sent_at: Instant,
}

/// Reliability state of one RakNet session
#[derive(Debug)]
pub struct ReliabilityLayer {
    mtu: usize,

    next_sequence: u32,
    next_reliable_index: u32,
    next_order_index: u32,
    next_split_id: u16,
    queue: VecDeque<Frame>,
    in_flight: BTreeMap<u32, InFlight>,

    acks: BTreeSet<u32>,
    nacks: BTreeSet<u32>,
    highest_sequence: Option<u32>,
    window: ReceiveWindow,
    splits: HashMap<u16, SplitAssembly>,
    expected_order: [u32; ORDER_CHANNELS],
    highest_sequenced: [u32; ORDER_CHANNELS],
    ordered: Vec<BTreeMap<u32, Bytes>>,
}

impl ReliabilityLayer {
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu: mtu as usize,
            next_sequence: 0,
            next_reliable_index: 0,
            next_order_index: 0,
            next_split_id: 0,
            queue: VecDeque::new(),
            in_flight: BTreeMap::new(),
            acks: BTreeSet::new(),
            nacks: BTreeSet::new(),
            highest_sequence: None,
            window: ReceiveWindow::default(),
            splits: HashMap::new(),
            expected_order: [0; ORDER_CHANNELS],
            highest_sequenced: [0; ORDER_CHANNELS],
            ordered: (0..ORDER_CHANNELS).map(|_| BTreeMap::new()).collect(),
        }
    }

    /// Room for frames in one datagram
    fn payload_budget(&self) -> usize {
        self.mtu - UDP_HEADER_SIZE - DATAGRAM_HEADER_SIZE
    }

    /// Whether sent reliable frames still await an ACK
    pub fn has_unacked(&self) -> bool {
        !self.in_flight.is_empty() || self.queue.iter().any(|f| f.reliability.is_reliable())
    }

    /// Queue a message for reliable, ordered delivery on channel 0
    pub fn send_ordered(&mut self, body: Bytes) {
        let order_index = self.next_order_index;
        self.next_order_index += 1;

        let max_body = self.payload_budget() - FRAME_HEADER_SIZE;
        if body.len() <= max_body {
            let reliable_index = self.take_reliable_index();
            self.queue.push_back(Frame {
                reliability: Reliability::ReliableOrdered,
                reliable_index,
                sequence_index: 0,
                order_index,
                order_channel: 0,
                split: None,
                body,
            });
            return;
        }

        let chunk = max_body - SPLIT_HEADER_SIZE;
        let count = body.len().div_ceil(chunk) as u32;
        let id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);
        for index in 0..count {
            let start = index as usize * chunk;
            let end = (start + chunk).min(body.len());
            let reliable_index = self.take_reliable_index();
            self.queue.push_back(Frame {
                reliability: Reliability::ReliableOrdered,
                reliable_index,
                sequence_index: 0,
                order_index,
                order_channel: 0,
                split: Some(Split { count, id, index }),
                body: body.slice(start..end),
            });
        }
    }

    /// Queue a message that may be lost (pings, pongs)
    pub fn send_unreliable(&mut self, body: Bytes) {
        self.queue.push_back(Frame::unreliable(body));
    }

    fn take_reliable_index(&mut self) -> u32 {
        let index = self.next_reliable_index;
        self.next_reliable_index += 1;
        index
    }

    /// Process one frame set, returning complete messages in delivery order
    pub fn receive(&mut self, data: &[u8]) -> TransportResult<Vec<Bytes>> {
        let datagram = Datagram::decode(data)?;
        self.track_sequence(datagram.sequence);

        let mut delivered = Vec::new();
        for frame in datagram.frames {
            if frame.reliability.is_reliable() && !self.window.insert(frame.reliable_index) {
                continue;
            }

            let reliability = frame.reliability;
            let channel = (frame.order_channel as usize).min(ORDER_CHANNELS - 1);
            let order_index = frame.order_index;
            let sequence_index = frame.sequence_index;

            let body = match frame.split {
                Some(split) => match self.reassemble(split, frame.body)? {
                    Some(body) => body,
                    None => continue,
                },
                None => frame.body,
            };

            if reliability.is_sequenced() {
                if order_index < self.expected_order[channel]
                    || sequence_index < self.highest_sequenced[channel]
                {
                    continue;
                }
                self.highest_sequenced[channel] = sequence_index + 1;
                delivered.push(body);
            } else if reliability.is_arranged() {
                self.arrange(channel, order_index, body, &mut delivered)?;
            } else {
                delivered.push(body);
            }
        }
        Ok(delivered)
    }

    fn track_sequence(&mut self, sequence: u32) {
        self.acks.insert(sequence);
        self.nacks.remove(&sequence);
        match self.highest_sequence {
            Some(highest) if sequence <= highest => {}
            Some(highest) => {
                if sequence - highest <= MAX_NACK_GAP {
                    self.nacks.extend(highest + 1..sequence);
                }
                self.highest_sequence = Some(sequence);
            }
            None => {
                if sequence <= MAX_NACK_GAP {
                    self.nacks.extend(0..sequence);
                }
                self.highest_sequence = Some(sequence);
            }
        }
    }

    fn reassemble(&mut self, split: Split, body: Bytes) -> TransportResult<Option<Bytes>> {
        if split.count == 0 || split.count > MAX_SPLIT_COUNT || split.index >= split.count {
            return Err(TransportError::ProtocolError(format!(
                "bad split {}/{}",
                split.index, split.count
            )));
        }
        if !self.splits.contains_key(&split.id) && self.splits.len() >= MAX_OPEN_SPLITS {
            return Err(TransportError::ProtocolError(
                "too many split messages in flight".to_string(),
            ));
        }

        let assembly = self.splits.entry(split.id).or_insert_with(|| SplitAssembly {
            parts: vec![None; split.count as usize],
            received: 0,
        });
        if assembly.parts.len() != split.count as usize {
            return Err(TransportError::ProtocolError(format!(
                "split {} changed its fragment count",
                split.id
            )));
        }

        let slot = &mut assembly.parts[split.index as usize];
        if slot.is_none() {
            *slot = Some(body);
            assembly.received += 1;
        }
        if assembly.received < assembly.parts.len() {
            return Ok(None);
        }

        let Some(assembly) = self.splits.remove(&split.id) else {
            return Ok(None);
        };
        let mut joined = BytesMut::new();
        for part in assembly.parts.into_iter().flatten() {
            joined.put_slice(&part);
        }
        Ok(Some(joined.freeze()))
    }

    fn arrange(
        &mut self,
        channel: usize,
        order_index: u32,
        body: Bytes,
        delivered: &mut Vec<Bytes>,
    ) -> TransportResult<()> {
        let expected = self.expected_order[channel];
        if order_index < expected {
            return Ok(());
        }
        if order_index > expected {
            if self.ordered[channel].len() >= MAX_ORDER_BUFFER {
                return Err(TransportError::ProtocolError(
                    "ordering buffer overflow".to_string(),
                ));
            }
            self.ordered[channel].insert(order_index, body);
            return Ok(());
        }

        delivered.push(body);
        let mut next = expected + 1;
        while let Some(body) = self.ordered[channel].remove(&next) {
            delivered.push(body);
            next += 1;
        }
        self.expected_order[channel] = next;
        self.highest_sequenced[channel] = 0;
        Ok(())
    }

    pub fn on_ack(&mut self, sequences: &[u32]) {
        for sequence in sequences {
            self.in_flight.remove(sequence);
        }
    }

    pub fn on_nack(&mut self, sequences: &[u32]) {
        for sequence in sequences.iter().rev() {
            if let Some(lost) = self.in_flight.remove(sequence) {
                for frame in lost.frames.into_iter().rev() {
                    self.queue.push_front(frame);
                }
            }
        }
    }

    /// Everything due at `now`: ACKs, NACKs, then frame sets
    pub fn flush(&mut self, now: Instant) -> Vec<Bytes> {
        let mut out = Vec::new();

        if !self.acks.is_empty() {
            out.push(encode_acks(FLAG_ACK, &self.acks));
            self.acks.clear();
        }
        if !self.nacks.is_empty() {
            // Sent once; the peer's resend timer covers a lost NACK
            out.push(encode_acks(FLAG_NACK, &self.nacks));
            self.nacks.clear();
        }

        let expired: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, sent)| now.duration_since(sent.sent_at) >= RESEND_TIMEOUT)
            .map(|(seq, _)| *seq)
            .collect();
        self.on_nack(&expired);

        let budget = self.payload_budget();
        while !self.queue.is_empty() {
            let mut frames = Vec::new();
            let mut size = 0;
            while let Some(frame) = self.queue.front() {
                let len = frame.encoded_len();
                if !frames.is_empty() && size + len > budget {
                    break;
                }
                size += len;
                if let Some(frame) = self.queue.pop_front() {
                    frames.push(frame);
                }
            }

            let sequence = self.next_sequence;
            self.next_sequence += 1;
            let datagram = Datagram { sequence, frames };
            out.push(datagram.encode());

            let reliable: Vec<Frame> = datagram
                .frames
                .into_iter()
                .filter(|f| f.reliability.is_reliable())
                .collect();
            if !reliable.is_empty() {
                self.in_flight.insert(
                    sequence,
                    InFlight {
                        frames: reliable,
                        sent_at: now,
                    },
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MTU: u16 = 1400;

    /// Deliver every frame set from `from` to `to`, applying ACKs both ways
    fn exchange(from: &mut ReliabilityLayer, to: &mut ReliabilityLayer, now: Instant) -> Vec<Bytes> {
        let mut delivered = Vec::new();
        for datagram in from.flush(now) {
            if datagram[0] & FLAG_ACK != 0 {
                to.on_ack(&decode_acks(&datagram).unwrap());
            } else if datagram[0] & FLAG_NACK != 0 {
                to.on_nack(&decode_acks(&datagram).unwrap());
            } else {
                delivered.extend(to.receive(&datagram).unwrap());
            }
        }
        delivered
    }

    #[test]
    fn test_frame_layout() {
        let frame = Frame {
            reliability: Reliability::ReliableOrdered,
            reliable_index: 1,
            sequence_index: 0,
            order_index: 2,
            order_channel: 0,
            split: None,
            body: Bytes::from_static(&[0xfe, 0xaa]),
        };
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(&buf[..], &[0x60, 0x00, 0x10, 1, 0, 0, 2, 0, 0, 0, 0xfe, 0xaa]);
        assert_eq!(buf.len(), frame.encoded_len());
    }

    #[test]
    fn test_ack_ranges() {
        let acks: BTreeSet<u32> = [1, 2, 3, 7].into_iter().collect();
        let bytes = encode_acks(FLAG_ACK, &acks);
        assert_eq!(bytes[0], 0xc0);
        assert_eq!(&bytes[1..3], &[0, 2]);
        assert_eq!(decode_acks(&bytes).unwrap(), vec![1, 2, 3, 7]);
    }

    #[test]
    fn test_large_message_is_split_and_reassembled() {
        let now = Instant::now();
        let mut a = ReliabilityLayer::new(MTU);
        let mut b = ReliabilityLayer::new(MTU);

        let body: Bytes = (0..5000u32).map(|i| i as u8).collect::<Vec<_>>().into();
        a.send_ordered(body.clone());
        let datagrams = a.flush(now);
        assert!(datagrams.len() >= 4);
        assert!(datagrams.iter().all(|d| d.len() <= MTU as usize - UDP_HEADER_SIZE));

        let mut delivered = Vec::new();
        for datagram in datagrams {
            delivered.extend(b.receive(&datagram).unwrap());
        }
        assert_eq!(delivered, vec![body]);
    }

    #[test]
    fn test_out_of_order_datagrams_are_reordered() {
        let now = Instant::now();
        let mut a = ReliabilityLayer::new(MTU);
        let mut b = ReliabilityLayer::new(MTU);

        a.send_ordered(Bytes::from_static(b"first"));
        let first = a.flush(now);
        a.send_ordered(Bytes::from_static(b"second"));
        let second = a.flush(now);

        assert!(b.receive(&second[0]).unwrap().is_empty());
        assert_eq!(
            b.receive(&first[0]).unwrap(),
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );

        // A duplicate is dropped
        assert!(b.receive(&first[0]).unwrap().is_empty());
    }

    #[test]
    fn test_lost_datagram_is_resent_after_nack() {
        let now = Instant::now();
        let mut a = ReliabilityLayer::new(MTU);
        let mut b = ReliabilityLayer::new(MTU);

        a.send_ordered(Bytes::from_static(b"lost"));
        let _dropped = a.flush(now);
        a.send_ordered(Bytes::from_static(b"kept"));
        assert!(exchange(&mut a, &mut b, now).is_empty());

        // b ACKs 1 and NACKs 0; a resends the lost frame
        assert!(exchange(&mut b, &mut a, now).is_empty());
        assert_eq!(
            exchange(&mut a, &mut b, now),
            vec![Bytes::from_static(b"lost"), Bytes::from_static(b"kept")]
        );

        exchange(&mut b, &mut a, now);
        assert!(!a.has_unacked());
    }

    #[test]
    fn test_unacked_datagram_is_resent_after_timeout() {
        let now = Instant::now();
        let mut a = ReliabilityLayer::new(MTU);
        a.send_ordered(Bytes::from_static(b"x"));
        assert_eq!(a.flush(now).len(), 1);
        assert!(a.flush(now + Duration::from_millis(100)).is_empty());

        let resent = a.flush(now + RESEND_TIMEOUT);
        assert_eq!(resent.len(), 1);
        let mut b = ReliabilityLayer::new(MTU);
        assert_eq!(b.receive(&resent[0]).unwrap(), vec![Bytes::from_static(b"x")]);
    }

    #[test]
    fn test_bad_split_count_is_rejected() {
        let datagram = Datagram {
            sequence: 0,
            frames: vec![Frame {
                reliability: Reliability::Reliable,
                reliable_index: 0,
                sequence_index: 0,
                order_index: 0,
                order_channel: 0,
                split: Some(Split {
                    count: MAX_SPLIT_COUNT + 1,
                    id: 0,
                    index: 0,
                }),
                body: Bytes::from_static(b"x"),
            }],
        };
        let mut b = ReliabilityLayer::new(MTU);
        assert!(b.receive(&datagram.encode()).is_err());
    }
}
