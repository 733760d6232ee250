//! UDP frame packet codec.
//!
//! # Packet Layout (12-byte header)
//!
//! ```text
//! [0..4]   frame_id        u32 BE  monotonically increasing per sender
//! [4..6]   part_index      u16 BE  0-based fragment index within this frame
//! [6..8]   total_parts     u16 BE  fragments in this frame
//! [8..12]  payload_length  u32 BE  bytes of payload following the header
//! [12..]   payload         [u8]    slice of the encoded frame
//! ```
//!
//! Packet size = 12 (header) + up to `max_packet_size - 12` payload bytes.

use swaplink_core::errors::PacketError;
use swaplink_core::protocol::HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u32,
    pub part_index: u16,
    pub total_parts: u16,
    pub payload_length: u32,
}

/// Receive-side bounds a header must respect.
#[derive(Debug, Clone, Copy)]
pub struct PacketLimits {
    pub max_payload: usize,
    pub max_parts: u16,
}

impl PacketHeader {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.frame_id.to_be_bytes());
        out.extend_from_slice(&self.part_index.to_be_bytes());
        out.extend_from_slice(&self.total_parts.to_be_bytes());
        out.extend_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Parse and validate one datagram. Returns the header and its payload.
    ///
    /// Trailing bytes past `payload_length` are ignored.
    pub fn parse(datagram: &[u8], limits: PacketLimits) -> Result<(Self, &[u8]), PacketError> {
        if datagram.len() < HEADER_SIZE {
            return Err(PacketError::TooShort { len: datagram.len() });
        }
        let header = Self {
            frame_id: u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]),
            part_index: u16::from_be_bytes([datagram[4], datagram[5]]),
            total_parts: u16::from_be_bytes([datagram[6], datagram[7]]),
            payload_length: u32::from_be_bytes([
                datagram[8],
                datagram[9],
                datagram[10],
                datagram[11],
            ]),
        };

        if header.total_parts == 0 || header.total_parts > limits.max_parts {
            return Err(PacketError::TotalPartsOutOfRange {
                total: header.total_parts,
                max: limits.max_parts,
            });
        }
        if header.part_index >= header.total_parts {
            return Err(PacketError::PartOutOfRange {
                index: header.part_index,
                total: header.total_parts,
            });
        }
        let declared = header.payload_length as usize;
        if declared > limits.max_payload {
            return Err(PacketError::PayloadTooLarge {
                declared: header.payload_length,
                max: limits.max_payload,
            });
        }
        let body = &datagram[HEADER_SIZE..];
        if declared > body.len() {
            return Err(PacketError::TruncatedPayload {
                declared: header.payload_length,
                available: body.len(),
            });
        }
        Ok((header, &body[..declared]))
    }
}

/// Number of fragments needed for `len` bytes. Zero for an empty frame.
pub fn fragment_count(len: usize, max_payload: usize) -> usize {
    if max_payload == 0 {
        return 0;
    }
    len.div_ceil(max_payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: PacketLimits = PacketLimits { max_payload: 1_188, max_parts: 200 };

    fn packet(header: PacketHeader, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        header.write_to(&mut out);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn header_layout_is_big_endian() {
        let h = PacketHeader { frame_id: 0x0102_0304, part_index: 5, total_parts: 9, payload_length: 3 };
        let bytes = packet(h, b"abc");
        assert_eq!(&bytes[..HEADER_SIZE], &[1, 2, 3, 4, 0, 5, 0, 9, 0, 0, 0, 3]);
        let (parsed, payload) = PacketHeader::parse(&bytes, LIMITS).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn rejects_short_datagram() {
        assert_eq!(
            PacketHeader::parse(&[0u8; 11], LIMITS),
            Err(PacketError::TooShort { len: 11 })
        );
    }

    #[test]
    fn rejects_part_index_past_total() {
        let h = PacketHeader { frame_id: 1, part_index: 4, total_parts: 4, payload_length: 0 };
        assert_eq!(
            PacketHeader::parse(&packet(h, &[]), LIMITS),
            Err(PacketError::PartOutOfRange { index: 4, total: 4 })
        );
    }

    #[test]
    fn rejects_total_parts_outside_cap() {
        let zero = PacketHeader { frame_id: 1, part_index: 0, total_parts: 0, payload_length: 0 };
        assert!(matches!(
            PacketHeader::parse(&packet(zero, &[]), LIMITS),
            Err(PacketError::TotalPartsOutOfRange { total: 0, .. })
        ));
        let huge = PacketHeader { frame_id: 1, part_index: 0, total_parts: 201, payload_length: 0 };
        assert!(matches!(
            PacketHeader::parse(&packet(huge, &[]), LIMITS),
            Err(PacketError::TotalPartsOutOfRange { total: 201, .. })
        ));
    }

    #[test]
    fn rejects_payload_length_mismatch() {
        let h = PacketHeader { frame_id: 1, part_index: 0, total_parts: 1, payload_length: 10 };
        assert_eq!(
            PacketHeader::parse(&packet(h, b"short"), LIMITS),
            Err(PacketError::TruncatedPayload { declared: 10, available: 5 })
        );
        let big = PacketHeader { frame_id: 1, part_index: 0, total_parts: 1, payload_length: 5_000 };
        assert!(matches!(
            PacketHeader::parse(&packet(big, &[0u8; 5_000]), LIMITS),
            Err(PacketError::PayloadTooLarge { declared: 5_000, .. })
        ));
    }

    #[test]
    fn fragment_count_rounds_up() {
        assert_eq!(fragment_count(0, 1_188), 0);
        assert_eq!(fragment_count(1, 1_188), 1);
        assert_eq!(fragment_count(1_188, 1_188), 1);
        assert_eq!(fragment_count(1_189, 1_188), 2);
        assert_eq!(fragment_count(10_000, 1_000), 10);
    }
}
