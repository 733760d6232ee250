//! Receive-side frame reassembly.
//!
//! Fragments land in a fixed arena of N slots indexed by `frame_id mod N`
//! (N = 5 by default). Each slot holds at most one [`FrameAssemblyBuffer`].
//!
//! ```text
//! fragment(frame_id, part) ─► monotonicity guard ─► slot[frame_id % N] ─► ready? ─► AssembledFrame
//!                               │ stale  → drop          │ occupied by older frame → evict
//!                               │ far below → reset      │ occupied by newer frame → drop
//! ```
//!
//! A frame finalizes once `received / total >= completeness_threshold`. Parts
//! that never arrived contribute no bytes; they do not block finalization.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use swaplink_core::config::TransportConfig;

use crate::packet::PacketHeader;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub slots: usize,
    pub completeness_threshold: f64,
    pub restart_window: u32,
    pub stale_window: u32,
    pub max_age: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for AssemblerConfig {
    fn from(t: &TransportConfig) -> Self {
        Self {
            slots: t.assembly_slots.max(1),
            completeness_threshold: t.completeness_threshold,
            restart_window: t.restart_window,
            stale_window: t.stale_window,
            max_age: t.buffer_max_age(),
        }
    }
}

// ── FrameAssemblyBuffer ───────────────────────────────────────────────────────

/// Fragments of one frame collected so far.
#[derive(Debug)]
pub struct FrameAssemblyBuffer {
    frame_id: u32,
    total_parts: u16,
    parts: Vec<Option<Bytes>>,
    received_count: u16,
    created_at: Instant,
}

impl FrameAssemblyBuffer {
    pub fn new(frame_id: u32, total_parts: u16, now: Instant) -> Self {
        Self {
            frame_id,
            total_parts,
            parts: vec![None; total_parts as usize],
            received_count: 0,
            created_at: now,
        }
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    pub fn total_parts(&self) -> u16 {
        self.total_parts
    }

    pub fn received_count(&self) -> u16 {
        self.received_count
    }

    /// Store a part. Returns `false` for a duplicate or out-of-range index.
    pub fn insert(&mut self, part_index: u16, payload: &[u8]) -> bool {
        match self.parts.get_mut(part_index as usize) {
            Some(slot @ None) => {
                *slot = Some(Bytes::copy_from_slice(payload));
                self.received_count += 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_ready(&self, threshold: f64) -> bool {
        self.received_count as f64 / self.total_parts as f64 >= threshold
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Concatenate received parts in index order. Consumes the buffer, so a
    /// frame can only be finalized once.
    pub fn finalize(self) -> AssembledFrame {
        let len = self.parts.iter().flatten().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(len);
        for part in self.parts.iter().flatten() {
            data.extend_from_slice(part);
        }
        AssembledFrame {
            frame_id: self.frame_id,
            data: data.freeze(),
            received_parts: self.received_count,
            total_parts: self.total_parts,
        }
    }
}

/// A finalized frame, ready for the decode stage.
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub frame_id: u32,
    pub data: Bytes,
    pub received_parts: u16,
    pub total_parts: u16,
}

impl AssembledFrame {
    pub fn is_complete(&self) -> bool {
        self.received_parts == self.total_parts
    }
}

// ── FrameAssembler ────────────────────────────────────────────────────────────

/// Result of feeding one fragment to the assembler.
#[derive(Debug)]
pub enum Ingest {
    /// Stored; frame not yet ready.
    Buffered,
    /// Frame reached the completeness threshold.
    Completed(AssembledFrame),
    /// Part already received.
    Duplicate,
    /// Frame at or behind the baseline, or older than the slot occupant.
    Stale,
    /// `total_parts` disagrees with earlier fragments of the same frame.
    Inconsistent,
}

/// Evictions and stream resets since the last [`FrameAssembler::take_counters`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerCounters {
    pub evicted: u64,
    pub resets: u64,
}

pub struct FrameAssembler {
    config: AssemblerConfig,
    slots: Vec<Option<FrameAssemblyBuffer>>,
    /// Last finalized frame id.
    baseline: Option<u32>,
    counters: AssemblerCounters,
}

impl FrameAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        let slots = (0..config.slots.max(1)).map(|_| None).collect();
        Self {
            config,
            slots,
            baseline: None,
            counters: AssemblerCounters::default(),
        }
    }

    pub fn baseline(&self) -> Option<u32> {
        self.baseline
    }

    /// Number of frames currently buffered.
    pub fn buffered(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn take_counters(&mut self) -> AssemblerCounters {
        std::mem::take(&mut self.counters)
    }

    /// Drop every buffer and forget the baseline.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.baseline = None;
        self.counters.resets += 1;
    }

    /// Feed one validated fragment.
    pub fn accept(&mut self, header: &PacketHeader, payload: &[u8], now: Instant) -> Ingest {
        let id = header.frame_id;

        if let Some(base) = self.baseline {
            if id <= base {
                if base - id <= self.config.restart_window {
                    return Ingest::Stale;
                }
                // Far below the baseline: the sender restarted or wrapped.
                self.reset();
            } else if id - base > self.config.stale_window {
                self.reset();
            }
        }

        let index = id as usize % self.slots.len();
        match &self.slots[index] {
            Some(occupant) if occupant.frame_id == id => {}
            Some(occupant) if occupant.frame_id > id => return Ingest::Stale,
            Some(_) => {
                self.slots[index] = Some(FrameAssemblyBuffer::new(id, header.total_parts, now));
                self.counters.evicted += 1;
            }
            None => {
                self.slots[index] = Some(FrameAssemblyBuffer::new(id, header.total_parts, now));
            }
        }

        let Some(buffer) = self.slots[index].as_mut() else {
            return Ingest::Stale;
        };
        if buffer.total_parts != header.total_parts {
            return Ingest::Inconsistent;
        }
        if !buffer.insert(header.part_index, payload) {
            return Ingest::Duplicate;
        }
        if !buffer.is_ready(self.config.completeness_threshold) {
            return Ingest::Buffered;
        }

        let Some(buffer) = self.slots[index].take() else {
            return Ingest::Stale;
        };
        self.baseline = Some(id);
        self.evict_older_than(id);
        Ingest::Completed(buffer.finalize())
    }

    /// Discard buffers older than the configured max age. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let max_age = self.config.max_age;
        let mut dropped = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|b| b.age(now) > max_age) {
                *slot = None;
                dropped += 1;
            }
        }
        self.counters.evicted += dropped as u64;
        dropped
    }

    fn evict_older_than(&mut self, frame_id: u32) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|b| b.frame_id < frame_id) {
                *slot = None;
                self.counters.evicted += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: f64) -> AssemblerConfig {
        AssemblerConfig {
            completeness_threshold: threshold,
            ..AssemblerConfig::default()
        }
    }

    fn header(frame_id: u32, part_index: u16, total_parts: u16, len: usize) -> PacketHeader {
        PacketHeader { frame_id, part_index, total_parts, payload_length: len as u32 }
    }

    /// Split `data` into `parts` chunks of `chunk` bytes (last one shorter).
    fn split(data: &[u8], chunk: usize) -> Vec<&[u8]> {
        data.chunks(chunk).collect()
    }

    fn feed_all(asm: &mut FrameAssembler, frame_id: u32, data: &[u8], chunk: usize, now: Instant) -> Option<AssembledFrame> {
        let parts = split(data, chunk);
        let total = parts.len() as u16;
        let mut done = None;
        for (i, p) in parts.iter().enumerate() {
            if let Ingest::Completed(f) = asm.accept(&header(frame_id, i as u16, total, p.len()), p, now) {
                done = Some(f);
            }
        }
        done
    }

    #[test]
    fn out_of_order_parts_finalize_once_with_original_bytes() {
        let mut asm = FrameAssembler::new(config(1.0));
        let now = Instant::now();
        let source: Vec<u8> = (0..1_000u32).map(|i| (i * 7) as u8).collect();
        let parts = split(&source, 300);
        assert_eq!(parts.len(), 4);

        let mut completed = Vec::new();
        for &i in &[2usize, 0, 3, 1] {
            let h = header(42, i as u16, 4, parts[i].len());
            if let Ingest::Completed(frame) = asm.accept(&h, parts[i], now) {
                completed.push(frame);
            }
        }
        assert_eq!(completed.len(), 1);
        let frame = &completed[0];
        assert_eq!(frame.frame_id, 42);
        assert!(frame.is_complete());
        assert_eq!(&frame.data[..], &source[..]);
        assert_eq!(asm.baseline(), Some(42));
        assert_eq!(asm.buffered(), 0);

        // A late duplicate of a finalized frame is stale, never a second finalize.
        let late = header(42, 1, 4, parts[1].len());
        assert!(matches!(asm.accept(&late, parts[1], now), Ingest::Stale));
    }

    #[test]
    fn full_threshold_waits_for_every_part() {
        let mut asm = FrameAssembler::new(config(1.0));
        let now = Instant::now();
        let payload = [1u8; 10];
        assert!(matches!(asm.accept(&header(1, 0, 4, 10), &payload, now), Ingest::Buffered));
        assert!(matches!(asm.accept(&header(1, 2, 4, 10), &payload, now), Ingest::Buffered));
        assert_eq!(asm.buffered(), 1);
        assert_eq!(asm.baseline(), None);
    }

    #[test]
    fn half_threshold_finalizes_on_second_part_with_gaps_skipped() {
        let mut asm = FrameAssembler::new(config(0.5));
        let now = Instant::now();
        assert!(matches!(asm.accept(&header(1, 3, 4, 2), b"dd", now), Ingest::Buffered));
        match asm.accept(&header(1, 0, 4, 2), b"aa", now) {
            Ingest::Completed(frame) => {
                assert_eq!(&frame.data[..], b"aadd");
                assert_eq!(frame.received_parts, 2);
                assert!(!frame.is_complete());
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_part_is_reported() {
        let mut asm = FrameAssembler::new(config(1.0));
        let now = Instant::now();
        assert!(matches!(asm.accept(&header(3, 0, 2, 1), b"x", now), Ingest::Buffered));
        assert!(matches!(asm.accept(&header(3, 0, 2, 1), b"x", now), Ingest::Duplicate));
        assert!(matches!(asm.accept(&header(3, 1, 3, 1), b"y", now), Ingest::Inconsistent));
    }

    #[test]
    fn far_backwards_frame_id_resets_stream() {
        let mut asm = FrameAssembler::new(config(1.0));
        let now = Instant::now();
        let data = vec![9u8; 50];

        assert!(feed_all(&mut asm, 100, &data, 20, now).is_some());
        assert!(feed_all(&mut asm, 101, &data, 20, now).is_some());
        // Partial 102 left buffered.
        assert!(matches!(asm.accept(&header(102, 0, 3, 20), &data[..20], now), Ingest::Buffered));
        assert_eq!(asm.buffered(), 1);
        asm.take_counters();

        // Within the window: stale.
        assert!(matches!(asm.accept(&header(60, 0, 1, 1), b"z", now), Ingest::Stale));

        // 101 - 5 > 50: sender restarted.
        let fresh: Vec<u8> = (0..70u8).collect();
        let frame = feed_all(&mut asm, 5, &fresh, 20, now).expect("frame 5 assembles");
        assert_eq!(&frame.data[..], &fresh[..]);
        assert_eq!(asm.baseline(), Some(5));
        assert_eq!(asm.buffered(), 0);
        assert_eq!(asm.take_counters().resets, 1);
    }

    #[test]
    fn forward_jump_beyond_stale_window_clears_buffers() {
        let mut asm = FrameAssembler::new(config(1.0));
        let now = Instant::now();
        assert!(feed_all(&mut asm, 10, b"abc", 2, now).is_some());
        assert!(matches!(asm.accept(&header(12, 0, 2, 1), b"x", now), Ingest::Buffered));
        assert!(matches!(asm.accept(&header(5_000, 0, 2, 1), b"y", now), Ingest::Buffered));
        assert_eq!(asm.buffered(), 1);
        assert_eq!(asm.baseline(), None);
    }

    #[test]
    fn arena_never_holds_more_than_slot_count() {
        let mut asm = FrameAssembler::new(config(1.0));
        let now = Instant::now();
        for id in 1..=12u32 {
            asm.accept(&header(id, 0, 2, 1), b"p", now);
            assert!(asm.buffered() <= 5);
        }
        assert_eq!(asm.buffered(), 5);
        // Frames 1..=7 were pushed out by 6..=12 landing on their slots.
        assert_eq!(asm.take_counters().evicted, 7);
        // An older frame never displaces a newer occupant.
        assert!(matches!(asm.accept(&header(7, 0, 2, 1), b"p", now), Ingest::Stale));
    }

    #[test]
    fn finalizing_evicts_older_partial_frames() {
        let mut asm = FrameAssembler::new(config(1.0));
        let now = Instant::now();
        asm.accept(&header(20, 0, 2, 1), b"a", now);
        asm.accept(&header(21, 0, 2, 1), b"b", now);
        assert!(feed_all(&mut asm, 22, b"cc", 1, now).is_some());
        assert_eq!(asm.buffered(), 0);
        assert_eq!(asm.take_counters().evicted, 2);
    }

    #[test]
    fn sweep_drops_old_buffers_regardless_of_progress() {
        let mut asm = FrameAssembler::new(AssemblerConfig {
            max_age: Duration::from_millis(100),
            ..config(1.0)
        });
        let t0 = Instant::now();
        asm.accept(&header(1, 0, 2, 1), b"a", t0);
        asm.accept(&header(2, 0, 2, 1), b"b", t0 + Duration::from_millis(80));
        assert_eq!(asm.sweep(t0 + Duration::from_millis(150)), 1);
        assert_eq!(asm.buffered(), 1);
        assert_eq!(asm.sweep(t0 + Duration::from_millis(500)), 1);
        assert_eq!(asm.buffered(), 0);
    }
}
