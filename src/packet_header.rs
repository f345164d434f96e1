use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Sequence numbers are 16-bit counters compared with wraparound-aware
///  ("serial number") arithmetic, see [crate::reliability::sequence_greater_than].
pub type PacketSeq = u16;

/// A bitfield where bit `i` means "the packet `i` sequence numbers before the
///  referenced one has been observed".
pub type AckBitfield = u32;

/// A small integer handle identifying one peer connection within a server's
///  fixed-size connection pool.
pub type ClientIndex = u8;

pub const INVALID_CLIENT_INDEX: ClientIndex = ClientIndex::MAX;

/// Total size of a datagram, header included. Anything bigger is never sent,
///  and silently truncated by the receive call if a foreign sender produces it.
pub const MAX_PACKET_SIZE: usize = 256;

pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - PacketHeader::SERIALIZED_LEN;

/// Discriminator of a packet's payload semantics.
///
/// The connection management subset (`ConnectionRequest` / `ConnectionSuccess`
///  / `ConnectionDenied`) bypasses the reliability layer entirely: such packets
///  carry a zeroed reliability segment and never advance sequence counters.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    KeepAlive = 0,
    Message = 1,
    ConnectionRequest = 2,
    ConnectionSuccess = 3,
    ConnectionDenied = 4,
}

impl PacketType {
    pub fn is_connection_management(&self) -> bool {
        matches!(
            self,
            PacketType::ConnectionRequest
                | PacketType::ConnectionSuccess
                | PacketType::ConnectionDenied
        )
    }
}

/// The fixed-size reliability segment embedded in every non-management packet:
///  the sender's sequence number for this packet, the highest sequence number
///  received from the peer (`ack`), and the bitfield of which of the 32 most
///  recent peer packets arrived.
#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub struct ReliabilitySegment {
    pub sequence: PacketSeq,
    pub ack: PacketSeq,
    pub ack_bitfield: AckBitfield,
}

impl Debug for ReliabilitySegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SEG{{#{} ack:{}:{:08x}}}", self.sequence, self.ack, self.ack_bitfield)
    }
}

impl ReliabilitySegment {
    pub const SERIALIZED_LEN: usize = size_of::<PacketSeq>() * 2 + size_of::<AckBitfield>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.sequence);
        buf.put_u16(self.ack);
        buf.put_u32(self.ack_bitfield);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ReliabilitySegment> {
        Ok(ReliabilitySegment {
            sequence: buf.try_get_u16()?,
            ack: buf.try_get_u16()?,
            ack_bitfield: buf.try_get_u32()?,
        })
    }
}

/// Fixed packet header - all numbers in network byte order:
/// ```ascii
/// 0:  app id (u8) - must match the configured protocol id, or the packet is
///      silently discarded as coming from a foreign/stale sender
/// 1:  packet type (u8)
/// 2:  client index (u8) - 0xff while unassigned
/// 3:  reliability segment (8 bytes) - zeroed for connection management types
/// 11: payload (0..=245 bytes)
/// ```
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub app_id: u8,
    pub packet_type: PacketType,
    pub client_index: ClientIndex,
    pub segment: ReliabilitySegment,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PCKT{{{:?}@{}:{:?}}}",
            self.packet_type, self.client_index, self.segment
        )
    }
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 3 * size_of::<u8>() + ReliabilitySegment::SERIALIZED_LEN;

    /// Header for a connection management packet, carrying a zeroed
    ///  reliability segment.
    pub fn for_management(app_id: u8, packet_type: PacketType, client_index: ClientIndex) -> PacketHeader {
        debug_assert!(packet_type.is_connection_management());
        PacketHeader {
            app_id,
            packet_type,
            client_index,
            segment: ReliabilitySegment::default(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.app_id);
        buf.put_u8(self.packet_type.into());
        buf.put_u8(self.client_index);
        self.segment.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let app_id = buf.try_get_u8()?;
        let raw_type = buf.try_get_u8()?;
        let packet_type = PacketType::try_from(raw_type)
            .map_err(|_| anyhow!("unsupported packet type {}", raw_type))?;
        let client_index = buf.try_get_u8()?;
        let segment = ReliabilitySegment::deser(buf)?;

        Ok(PacketHeader {
            app_id,
            packet_type,
            client_index,
            segment,
        })
    }
}

/// Assemble a complete outgoing datagram: header followed by payload, bounded
///  by [MAX_PACKET_SIZE].
pub fn encode_packet(header: &PacketHeader, payload: &[u8]) -> anyhow::Result<bytes::BytesMut> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        anyhow::bail!(
            "payload of {} bytes exceeds the per-packet budget of {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        );
    }

    let mut buf = bytes::BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
    header.ser(&mut buf);
    buf.put_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::keep_alive(PacketHeader { app_id: 0x4b, packet_type: PacketType::KeepAlive, client_index: 3, segment: ReliabilitySegment { sequence: 17, ack: 16, ack_bitfield: 0xffff_fffe } })]
    #[case::message(PacketHeader { app_id: 0x4b, packet_type: PacketType::Message, client_index: 0, segment: ReliabilitySegment { sequence: u16::MAX, ack: 0, ack_bitfield: 1 } })]
    #[case::request(PacketHeader::for_management(1, PacketType::ConnectionRequest, INVALID_CLIENT_INDEX))]
    #[case::success(PacketHeader::for_management(1, PacketType::ConnectionSuccess, 0))]
    #[case::denied(PacketHeader::for_management(1, PacketType::ConnectionDenied, INVALID_CLIENT_INDEX))]
    fn test_header_ser_deser(#[case] header: PacketHeader) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_header_layout() {
        let header = PacketHeader {
            app_id: 0xab,
            packet_type: PacketType::Message,
            client_index: 7,
            segment: ReliabilitySegment {
                sequence: 0x0102,
                ack: 0x0304,
                ack_bitfield: 0x05060708,
            },
        };

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(
            buf.as_ref(),
            &[0xab, 1, 7, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_management_segment_is_zeroed() {
        let header = PacketHeader::for_management(9, PacketType::ConnectionRequest, INVALID_CLIENT_INDEX);

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(&buf.as_ref()[3..], &[0u8; ReliabilitySegment::SERIALIZED_LEN]);
    }

    #[test]
    fn test_deser_unknown_packet_type() {
        let buf = [0x4bu8, 99, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut b: &[u8] = &buf;
        assert!(PacketHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_deser_truncated() {
        let buf = [0x4bu8, 0, 0, 0, 1];
        let mut b: &[u8] = &buf;
        assert!(PacketHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_payload_budget() {
        assert_eq!(PacketHeader::SERIALIZED_LEN, 11);
        assert_eq!(MAX_PAYLOAD_SIZE, 245);
    }

    #[test]
    fn test_encode_packet() {
        let header = PacketHeader::for_management(1, PacketType::ConnectionSuccess, 5);

        let buf = encode_packet(&header, b"abc").unwrap();
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN + 3);
        assert_eq!(&buf[PacketHeader::SERIALIZED_LEN..], b"abc");

        assert!(encode_packet(&header, &[0u8; MAX_PAYLOAD_SIZE]).is_ok());
        assert!(encode_packet(&header, &[0u8; MAX_PAYLOAD_SIZE + 1]).is_err());
    }
}
