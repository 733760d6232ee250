use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use swaplink_core::TransportHealth;

/// Lock-free counters shared by the transport loop, the decode workers and
/// whoever asks for [`TransportHealth`].
#[derive(Debug, Default)]
pub struct TransportStats {
    pub running: AtomicBool,
    pub failed: AtomicBool,
    pub frames_sent: AtomicU64,
    pub frames_abandoned: AtomicU64,
    pub frames_oversized: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_invalid: AtomicU64,
    pub frames_assembled: AtomicU64,
    pub frames_stale: AtomicU64,
    pub frames_evicted: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub decode_errors: AtomicU64,
    pub decode_dropped: AtomicU64,
    pub stream_resets: AtomicU64,
    pub loop_errors: AtomicU64,
}

/// Bump a counter by one.
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    if n > 0 {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportHealth {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TransportHealth {
            running: self.running.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            frames_sent: get(&self.frames_sent),
            frames_abandoned: get(&self.frames_abandoned),
            frames_oversized: get(&self.frames_oversized),
            packets_sent: get(&self.packets_sent),
            packets_received: get(&self.packets_received),
            packets_invalid: get(&self.packets_invalid),
            frames_assembled: get(&self.frames_assembled),
            frames_stale: get(&self.frames_stale),
            frames_evicted: get(&self.frames_evicted),
            frames_decoded: get(&self.frames_decoded),
            decode_errors: get(&self.decode_errors),
            decode_dropped: get(&self.decode_dropped),
            stream_resets: get(&self.stream_resets),
            loop_errors: get(&self.loop_errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = TransportStats::default();
        inc(&stats.frames_sent);
        add(&stats.packets_sent, 4);
        stats.running.store(true, Ordering::Release);
        let h = stats.snapshot();
        assert!(h.running);
        assert!(!h.failed);
        assert_eq!(h.frames_sent, 1);
        assert_eq!(h.packets_sent, 4);
        assert_eq!(h.decode_errors, 0);
    }
}
