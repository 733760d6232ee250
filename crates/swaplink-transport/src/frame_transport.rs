//! FrameTransport: one UDP socket, one loop thread, both directions.
//!
//! ```text
//!  producer ──submit_frame──► [latest-frame watch] ─┐
//!                                                   ▼
//!                 ┌──────────── swaplink-transport thread ────────────┐
//!                 │ 1. admit newest frame (abandon the previous one)   │
//!                 │ 2. send burst  ───────────────► target (watch)     │
//!                 │ 3. recv burst (1 ms timeout)                       │
//!                 │ 4. reassemble ──► DecodePool ──► FrameReady event  │
//!                 │ 5-6. monotonicity guard, buffer eviction           │
//!                 │ 7. idle sleep                                      │
//!                 └────────────────────────────────────────────────────┘
//! ```
//!
//! The loop owns the socket. The latest frame and the target address are the
//! only state shared with other contexts, both behind `watch` channels.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use swaplink_core::config::TransportConfig;
use swaplink_core::errors::TransportError;
use swaplink_core::{EventSender, NodeEvent, TransportHealth};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::assembler::{AssemblerConfig, FrameAssembler, Ingest};
use crate::decode::{join_bounded, DecodePool, FrameDecoder};
use crate::fragment::OutgoingFrame;
use crate::packet::{PacketHeader, PacketLimits};
use crate::stats::{add, inc, TransportStats};
use crate::target::{spawn_target_updater, TargetHandle};

/// Counters are logged once per this many frames sent or assembled.
const LOG_EVERY: u64 = 300;

// ── FrameSink ─────────────────────────────────────────────────────────────────

/// Producer side of the latest-frame register. Each submit replaces whatever
/// frame has not yet been picked up.
#[derive(Debug, Clone)]
pub struct FrameSink {
    latest: Arc<watch::Sender<Option<Bytes>>>,
}

impl FrameSink {
    pub fn submit(&self, frame: Bytes) {
        self.latest.send_replace(Some(frame));
    }
}

// ── FrameTransport ────────────────────────────────────────────────────────────

struct Running {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct FrameTransport {
    config: TransportConfig,
    decoder: Arc<dyn FrameDecoder>,
    events: EventSender,
    stats: Arc<TransportStats>,
    sink: FrameSink,
    target: TargetHandle,
    /// Survives restarts so peers never see the sequence jump backwards.
    next_frame_id: Arc<AtomicU32>,
    running: Option<Running>,
}

impl FrameTransport {
    /// Create a stopped transport. Must be called inside a tokio runtime
    /// (the target updater is spawned here).
    pub fn new(config: TransportConfig, decoder: Arc<dyn FrameDecoder>, events: EventSender) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            config,
            decoder,
            events,
            stats: Arc::new(TransportStats::default()),
            sink: FrameSink { latest: Arc::new(latest) },
            target: spawn_target_updater(),
            next_frame_id: Arc::new(AtomicU32::new(0)),
            running: None,
        }
    }

    /// Bind the socket and start the loop and decode pool. Bind failure is
    /// returned to the caller.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.running.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let addr = self.config.bind_addr();
        let bind_err = |source| TransportError::Bind { addr: addr.clone(), source };
        let socket = UdpSocket::bind(&addr).map_err(bind_err)?;
        socket
            .set_read_timeout(Some(self.config.recv_timeout()))
            .map_err(bind_err)?;
        let local_addr = socket.local_addr().map_err(bind_err)?;

        let pool = DecodePool::spawn(
            self.config.decode_workers,
            self.config.decode_queue,
            Arc::clone(&self.decoder),
            self.events.clone(),
            Arc::clone(&self.stats),
        )?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let transport_loop = TransportLoop {
            socket,
            config: self.config.clone(),
            limits: PacketLimits {
                max_payload: self.config.max_payload(),
                max_parts: self.config.max_parts,
            },
            frames: self.sink.latest.subscribe(),
            target: self.target.subscribe(),
            assembler: FrameAssembler::new(AssemblerConfig::from(&self.config)),
            pool,
            stats: Arc::clone(&self.stats),
            events: self.events.clone(),
            next_frame_id: Arc::clone(&self.next_frame_id),
            shutdown: Arc::clone(&shutdown),
        };

        self.stats.failed.store(false, Ordering::Release);
        self.stats.running.store(true, Ordering::Release);
        let handle = std::thread::Builder::new()
            .name("swaplink-transport".into())
            .spawn(move || transport_loop.run())
            .map_err(|source| {
                self.stats.running.store(false, Ordering::Release);
                TransportError::Spawn { name: "swaplink-transport".into(), source }
            })?;

        info!("[Transport] UDP socket bound on {}", local_addr);
        self.running = Some(Running { shutdown, handle, local_addr });
        Ok(())
    }

    /// Signal the loop, then wait a bounded time for it to close the socket
    /// and drain the decode pool. Blocks the calling thread.
    pub fn stop(&mut self) {
        let Some(run) = self.running.take() else {
            return;
        };
        run.shutdown.store(true, Ordering::Release);
        // Loop exit plus its own bounded decode-pool shutdown.
        let timeout = self.config.shutdown_timeout() * 2;
        if join_bounded(vec![run.handle], timeout) > 0 {
            warn!("[Transport] loop did not exit within {:?}, detaching", timeout);
        }
        self.stats.running.store(false, Ordering::Release);
        info!("[Transport] stopped");
    }

    /// Stop, settle, start. Not a graceful drain.
    pub fn restart(&mut self) -> Result<(), TransportError> {
        self.stop();
        std::thread::sleep(self.config.restart_settle());
        self.start()
    }

    /// Offer a freshly captured frame. Replaces any frame not yet picked up.
    pub fn submit_frame(&self, frame: Bytes) {
        self.sink.submit(frame);
    }

    pub fn frame_sink(&self) -> FrameSink {
        self.sink.clone()
    }

    /// Stream to `host:port` once it resolves.
    pub fn set_target(&self, host: &str, port: u16) {
        self.target.set(host, port);
    }

    pub fn clear_target(&self) {
        self.target.clear();
    }

    pub fn target(&self) -> &TargetHandle {
        &self.target
    }

    pub fn health(&self) -> TransportHealth {
        self.stats.snapshot()
    }

    /// Shared counters, readable from other tasks without the transport.
    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── TransportLoop ─────────────────────────────────────────────────────────────

struct TransportLoop {
    socket: UdpSocket,
    config: TransportConfig,
    limits: PacketLimits,
    frames: watch::Receiver<Option<Bytes>>,
    target: watch::Receiver<Option<SocketAddr>>,
    assembler: FrameAssembler,
    pool: DecodePool,
    stats: Arc<TransportStats>,
    events: EventSender,
    next_frame_id: Arc<AtomicU32>,
    shutdown: Arc<AtomicBool>,
}

/// Per-run state that never leaves the loop thread.
struct LoopState {
    outgoing: Option<OutgoingFrame>,
    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    consecutive_errors: u32,
    sent: u64,
    assembled: u64,
}

impl TransportLoop {
    fn run(mut self) {
        info!(
            "[Transport] loop started (max_payload={}, threshold={})",
            self.limits.max_payload, self.config.completeness_threshold
        );
        let mut st = LoopState {
            outgoing: None,
            send_buf: Vec::with_capacity(self.config.max_packet_size),
            // Room for oversized datagrams so they can be rejected cleanly.
            recv_buf: vec![0u8; 65_536],
            consecutive_errors: 0,
            sent: 0,
            assembled: 0,
        };

        while !self.shutdown.load(Ordering::Acquire) {
            let mut busy = self.admit_frame(&mut st);
            busy |= self.send_burst(&mut st);
            busy |= self.recv_burst(&mut st);

            self.assembler.sweep(Instant::now());
            let counters = self.assembler.take_counters();
            add(&self.stats.frames_evicted, counters.evicted);
            add(&self.stats.stream_resets, counters.resets);

            if st.consecutive_errors > self.config.max_consecutive_errors {
                let reason = format!("{} consecutive socket errors", st.consecutive_errors);
                error!("[Transport] {}; stopping loop", reason);
                self.stats.failed.store(true, Ordering::Release);
                let _ = self.events.send(NodeEvent::TransportFailed { reason });
                break;
            }

            if !busy {
                std::thread::sleep(self.config.idle_sleep());
            }
        }

        // Socket goes first, then the workers.
        let TransportLoop { socket, pool, stats, config, .. } = self;
        drop(socket);
        pool.shutdown(config.shutdown_timeout());
        stats.running.store(false, Ordering::Release);
        debug!("[Transport] loop exited");
    }

    /// Step 1: pick up a newer frame if the producer replaced the register.
    fn admit_frame(&mut self, st: &mut LoopState) -> bool {
        if !self.frames.has_changed().unwrap_or(false) {
            return false;
        }
        let Some(data) = self.frames.borrow_and_update().clone() else {
            return false;
        };
        if data.is_empty() {
            return false;
        }

        if st.outgoing.take().is_some_and(|prev| !prev.is_complete()) {
            inc(&self.stats.frames_abandoned);
        }
        let frame_id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        let len = data.len();
        match OutgoingFrame::new(frame_id, data, self.limits.max_payload, self.limits.max_parts) {
            Some(frame) => st.outgoing = Some(frame),
            None => {
                inc(&self.stats.frames_oversized);
                debug!("[Transport] frame {} ({} bytes) exceeds {} parts, dropped", frame_id, len, self.limits.max_parts);
            }
        }
        true
    }

    /// Step 2: up to `send_burst` fragments of the current frame.
    fn send_burst(&mut self, st: &mut LoopState) -> bool {
        let Some(frame) = st.outgoing.as_mut() else {
            return false;
        };
        let Some(target) = *self.target.borrow() else {
            // Nobody to stream to; the frame is simply not sent.
            st.outgoing = None;
            return false;
        };

        let mut sent_any = false;
        for _ in 0..self.config.send_burst {
            if !frame.next_packet(&mut st.send_buf) {
                break;
            }
            match self.socket.send_to(&st.send_buf, target) {
                Ok(_) => {
                    inc(&self.stats.packets_sent);
                    st.consecutive_errors = 0;
                    sent_any = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    record_error(&self.stats, &mut st.consecutive_errors, "send", &e);
                    break;
                }
            }
        }

        if frame.is_complete() {
            st.outgoing = None;
            inc(&self.stats.frames_sent);
            st.sent += 1;
            if st.sent % LOG_EVERY == 0 {
                self.log_counters();
            }
        }
        sent_any
    }

    /// Steps 3-5: up to `recv_burst` datagrams into the assembler.
    fn recv_burst(&mut self, st: &mut LoopState) -> bool {
        let mut received_any = false;
        for _ in 0..self.config.recv_burst {
            let n = match self.socket.recv_from(&mut st.recv_buf) {
                Ok((n, _from)) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                // ICMP port-unreachable from a peer that went away.
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    record_error(&self.stats, &mut st.consecutive_errors, "receive", &e);
                    break;
                }
            };
            received_any = true;
            st.consecutive_errors = 0;
            inc(&self.stats.packets_received);

            let (header, payload) = match PacketHeader::parse(&st.recv_buf[..n], self.limits) {
                Ok(parsed) => parsed,
                Err(e) => {
                    inc(&self.stats.packets_invalid);
                    trace!("[Transport] dropped datagram: {}", e);
                    continue;
                }
            };

            match self.assembler.accept(&header, payload, Instant::now()) {
                Ingest::Completed(frame) => {
                    inc(&self.stats.frames_assembled);
                    st.assembled += 1;
                    if st.assembled % LOG_EVERY == 0 {
                        self.log_counters();
                    }
                    self.pool.submit(frame);
                }
                Ingest::Stale => inc(&self.stats.frames_stale),
                Ingest::Inconsistent => inc(&self.stats.packets_invalid),
                Ingest::Buffered | Ingest::Duplicate => {}
            }
        }
        received_any
    }

    fn log_counters(&self) {
        let h = self.stats.snapshot();
        info!(
            "[Transport] sent={} abandoned={} assembled={} decoded={} stale={} evicted={} invalid={} dropped={}",
            h.frames_sent,
            h.frames_abandoned,
            h.frames_assembled,
            h.frames_decoded,
            h.frames_stale,
            h.frames_evicted,
            h.packets_invalid,
            h.decode_dropped,
        );
    }
}

fn record_error(stats: &TransportStats, consecutive: &mut u32, op: &str, e: &std::io::Error) {
    *consecutive += 1;
    inc(&stats.loop_errors);
    if *consecutive <= 3 || *consecutive % 50 == 0 {
        warn!("[Transport] {} error ({} in a row): {}", op, consecutive, e);
    }
}
