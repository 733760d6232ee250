//! Send-side fragmentation of one captured frame.

use bytes::Bytes;

use crate::packet::{fragment_count, PacketHeader};

/// A frame being transmitted, fragment by fragment, in part-index order.
#[derive(Debug)]
pub struct OutgoingFrame {
    frame_id: u32,
    data: Bytes,
    max_payload: usize,
    total_parts: u16,
    next_part: u16,
}

impl OutgoingFrame {
    /// Prepare `data` for transmission. Returns `None` when the frame is empty
    /// or would need more than `max_parts` fragments.
    pub fn new(frame_id: u32, data: Bytes, max_payload: usize, max_parts: u16) -> Option<Self> {
        let parts = fragment_count(data.len(), max_payload);
        if parts == 0 || parts > max_parts as usize {
            return None;
        }
        Some(Self {
            frame_id,
            data,
            max_payload,
            total_parts: parts as u16,
            next_part: 0,
        })
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    pub fn total_parts(&self) -> u16 {
        self.total_parts
    }

    pub fn is_complete(&self) -> bool {
        self.next_part >= self.total_parts
    }

    /// Write the next fragment (header + payload) into `out`, replacing its
    /// contents. Returns `false` once every fragment has been produced.
    pub fn next_packet(&mut self, out: &mut Vec<u8>) -> bool {
        if self.is_complete() {
            return false;
        }
        let offset = self.next_part as usize * self.max_payload;
        let end = (offset + self.max_payload).min(self.data.len());
        let payload = &self.data[offset..end];

        out.clear();
        PacketHeader {
            frame_id: self.frame_id,
            part_index: self.next_part,
            total_parts: self.total_parts,
            payload_length: payload.len() as u32,
        }
        .write_to(out);
        out.extend_from_slice(payload);

        self.next_part += 1;
        true
    }
}
