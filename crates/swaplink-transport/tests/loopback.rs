use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use swaplink_core::config::TransportConfig;
use swaplink_core::{event_channel, NodeEvent};
use swaplink_transport::{FrameTransport, JpegFrameDecoder};

fn loopback() -> TransportConfig {
    TransportConfig {
        bind: "127.0.0.1".into(),
        port: 0,
        ..TransportConfig::default()
    }
}

/// A JPEG-framed payload spanning several datagrams.
fn fake_jpeg(len: usize) -> Bytes {
    let mut v = vec![0xFF, 0xD8];
    v.extend((0..len).map(|i| (i % 251) as u8));
    v.extend_from_slice(&[0xFF, 0xD9]);
    Bytes::from(v)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_transports_exchange_a_frame() {
    let (tx_a, _rx_a) = event_channel();
    let (tx_b, mut rx_b) = event_channel();

    let mut a = FrameTransport::new(loopback(), Arc::new(JpegFrameDecoder), tx_a);
    let mut b = FrameTransport::new(loopback(), Arc::new(JpegFrameDecoder), tx_b);
    a.start().unwrap();
    b.start().unwrap();

    let b_addr = b.local_addr().unwrap();
    a.target().set_addr(b_addr);

    let frame = fake_jpeg(5_000);
    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            // Re-submit until the target update has landed and a frame gets through.
            a.submit_frame(frame.clone());
            tokio::select! {
                ev = rx_b.recv() => match ev {
                    Some(NodeEvent::FrameReady(f)) => break f,
                    Some(_) => {}
                    None => panic!("event channel closed"),
                },
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    })
    .await
    .expect("frame delivered over loopback");

    assert_eq!(received.data, frame);
    let sender = a.health();
    assert!(sender.frames_sent >= 1);
    assert!(sender.packets_sent >= 5);
    let receiver = b.health();
    assert!(receiver.frames_assembled >= 1);
    assert_eq!(receiver.packets_invalid, 0);

    a.stop();
    b.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_keeps_streaming() {
    let (tx_a, _rx_a) = event_channel();
    let (tx_b, mut rx_b) = event_channel();
    let mut a = FrameTransport::new(loopback(), Arc::new(JpegFrameDecoder), tx_a);
    let mut b = FrameTransport::new(loopback(), Arc::new(JpegFrameDecoder), tx_b);
    a.start().unwrap();
    b.start().unwrap();
    a.target().set_addr(b.local_addr().unwrap());

    a.restart().unwrap();
    assert!(a.is_running());

    let got = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            a.submit_frame(fake_jpeg(100));
            tokio::select! {
                Some(NodeEvent::FrameReady(f)) = rx_b.recv() => break f,
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    })
    .await
    .expect("frame after restart");
    assert_eq!(got.data.len(), 104);
}
