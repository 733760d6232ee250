//! Decode stage: a small pool of worker threads turning assembled frames
//! into [`DecodedFrame`]s.
//!
//! ```text
//! transport loop ──try_send──► worker[0] queue ─┐
//!        (round-robin)        worker[1] queue ──┼─► FrameDecoder ─► NodeEvent::FrameReady
//!                             ...               ┘
//! ```
//!
//! Queues are bounded. A full queue drops the frame instead of stalling the
//! transport loop. Decode failures are counted and logged, never fatal.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use swaplink_core::errors::{DecodeError, TransportError};
use swaplink_core::{DecodedFrame, EventSender, NodeEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assembler::AssembledFrame;
use crate::stats::{inc, TransportStats};

// ── FrameDecoder ──────────────────────────────────────────────────────────────

/// Turns the bytes of one reassembled frame into something renderable.
///
/// Called from a dedicated worker thread, so implementations may block.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, frame: &AssembledFrame) -> Result<DecodedFrame, DecodeError>;

    fn name(&self) -> &'static str;
}

/// Validates JPEG framing (SOI / EOI markers) and reads the dimensions from
/// the first start-of-frame segment. Pixel data is passed through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegFrameDecoder;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

impl FrameDecoder for JpegFrameDecoder {
    fn decode(&self, frame: &AssembledFrame) -> Result<DecodedFrame, DecodeError> {
        let data = &frame.data;
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }
        let fail = |reason: &str| DecodeError::DecodeFailed {
            frame_id: frame.frame_id,
            reason: reason.to_owned(),
        };
        if data.len() < 4 || data[..2] != SOI {
            return Err(fail("missing start-of-image marker"));
        }
        if data[data.len() - 2..] != EOI {
            return Err(fail("missing end-of-image marker"));
        }
        let dims = jpeg_dimensions(data);
        Ok(DecodedFrame {
            frame_id: frame.frame_id,
            data: data.clone(),
            width: dims.map(|(w, _)| w),
            height: dims.map(|(_, h)| h),
        })
    }

    fn name(&self) -> &'static str {
        "jpeg"
    }
}

/// Walk JPEG segments up to start-of-scan looking for an SOFn header.
fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        match marker {
            // Fill byte.
            0xFF => {
                pos += 1;
                continue;
            }
            // Standalone markers carry no length.
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            0xDA | 0xD9 => return None,
            _ => {}
        }
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let is_sof = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            // FF Cn Lh Ll P Yh Yl Xh Xl
            if pos + 9 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[pos + 5], data[pos + 6]]) as u32;
            let width = u16::from_be_bytes([data[pos + 7], data[pos + 8]]) as u32;
            return Some((width, height));
        }
        pos += 2 + len;
    }
    None
}

// ── DecodePool ────────────────────────────────────────────────────────────────

pub struct DecodePool {
    queues: Vec<mpsc::Sender<AssembledFrame>>,
    workers: Vec<JoinHandle<()>>,
    next: usize,
    stats: Arc<TransportStats>,
}

impl DecodePool {
    /// Start `workers` decode threads, each with a queue of `queue_depth`.
    pub fn spawn(
        workers: usize,
        queue_depth: usize,
        decoder: Arc<dyn FrameDecoder>,
        events: EventSender,
        stats: Arc<TransportStats>,
    ) -> Result<Self, TransportError> {
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers.max(1) {
            let (tx, rx) = mpsc::channel::<AssembledFrame>(queue_depth.max(1));
            let decoder = Arc::clone(&decoder);
            let events = events.clone();
            let stats_w = Arc::clone(&stats);
            let name = format!("swaplink-decode-{index}");

            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || decode_worker(index, rx, decoder, events, stats_w))
                .map_err(|source| TransportError::Spawn { name, source })?;

            queues.push(tx);
            handles.push(handle);
        }

        info!("[Decode] {} workers started ({})", handles.len(), decoder.name());
        Ok(Self { queues, workers: handles, next: 0, stats })
    }

    /// Hand a frame to the next worker. Returns `false` when the frame was
    /// dropped because that worker is backed up.
    pub fn submit(&mut self, frame: AssembledFrame) -> bool {
        let index = self.next % self.queues.len();
        self.next = self.next.wrapping_add(1);
        match self.queues[index].try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                inc(&self.stats.decode_dropped);
                debug!("[Decode] worker {} busy, dropped frame {}", index, frame.frame_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(frame)) => {
                inc(&self.stats.decode_dropped);
                warn!("[Decode] worker {} gone, dropped frame {}", index, frame.frame_id);
                false
            }
        }
    }

    /// Close the queues and wait up to `timeout` for workers to drain.
    /// Workers still busy after that are left to finish on their own.
    pub fn shutdown(self, timeout: Duration) {
        drop(self.queues);
        let busy = join_bounded(self.workers, timeout);
        if busy == 0 {
            debug!("[Decode] all workers joined");
        } else {
            warn!("[Decode] {} workers still busy after {:?}, detaching", busy, timeout);
        }
    }
}

/// Join `handles`, giving up after `timeout`. Returns how many threads were
/// still running and got detached.
pub(crate) fn join_bounded<T>(handles: Vec<JoinHandle<T>>, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let mut pending = handles;
    loop {
        let (done, busy): (Vec<_>, Vec<_>) = pending.into_iter().partition(|h| h.is_finished());
        for handle in done {
            let _ = handle.join();
        }
        pending = busy;
        if pending.is_empty() || Instant::now() >= deadline {
            return pending.len();
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn decode_worker(
    index: usize,
    mut rx: mpsc::Receiver<AssembledFrame>,
    decoder: Arc<dyn FrameDecoder>,
    events: EventSender,
    stats: Arc<TransportStats>,
) {
    let mut errors: u64 = 0;
    while let Some(frame) = rx.blocking_recv() {
        match decoder.decode(&frame) {
            Ok(decoded) => {
                inc(&stats.frames_decoded);
                if events.send(NodeEvent::FrameReady(decoded)).is_err() {
                    debug!("[Decode] event channel closed");
                }
            }
            Err(e) => {
                inc(&stats.decode_errors);
                errors += 1;
                if errors <= 20 || errors % 120 == 0 {
                    warn!("[Decode] worker {}: {} ({} errors)", index, e, errors);
                }
            }
        }
    }
    debug!("[Decode] worker {} exiting", index);
}
