//! Synthetic test-pattern frames standing in for a camera.
//!
//! Each frame is JPEG-framed (SOI, an SOF0 header carrying the dimensions,
//! SOS, a scrolling byte pattern, EOI) so the receiving decoder sees valid
//! markers and real dimensions without an encoder in the loop.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use swaplink_transport::FrameSink;
use tokio::task::JoinHandle;

pub const PATTERN_WIDTH: u16 = 320;
pub const PATTERN_HEIGHT: u16 = 240;
/// Scan bytes per frame; about 10 datagrams at the default packet size.
const SCAN_LEN: usize = 12_000;

pub struct SyntheticSource {
    task: JoinHandle<()>,
}

impl SyntheticSource {
    pub fn spawn(sink: FrameSink, fps: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut n: u32 = 0;
            loop {
                ticker.tick().await;
                sink.submit(test_pattern(n, PATTERN_WIDTH, PATTERN_HEIGHT));
                n = n.wrapping_add(1);
            }
        });
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

/// Build frame `n` of the pattern.
pub fn test_pattern(n: u32, width: u16, height: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(SCAN_LEN + 32);
    buf.put_slice(&[0xFF, 0xD8]);

    // SOF0: length 17, precision 8, height, width, 3 components.
    buf.put_slice(&[0xFF, 0xC0]);
    buf.put_u16(17);
    buf.put_u8(8);
    buf.put_u16(height);
    buf.put_u16(width);
    buf.put_u8(3);
    for id in 1..=3u8 {
        buf.put_slice(&[id, 0x11, 0x00]);
    }

    buf.put_slice(&[0xFF, 0xDA]);
    buf.put_u16(2);
    // Scrolling ramp; 0xFF never appears so no marker is faked.
    let shift = n as usize;
    for i in 0..SCAN_LEN {
        buf.put_u8(((i + shift) % 0xFF) as u8);
    }

    buf.put_slice(&[0xFF, 0xD9]);
    buf.freeze()
}
