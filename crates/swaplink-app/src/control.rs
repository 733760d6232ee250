//! Adapters from the pairing service's seams to the concrete subsystems.

use swaplink_discovery::DiscoveryHandle;
use swaplink_pairing::{DiscoveryControl, TargetControl};
use swaplink_transport::TargetHandle;

pub struct ScannerControl(pub DiscoveryHandle);

impl DiscoveryControl for ScannerControl {
    fn pause(&self) {
        self.0.pause();
    }

    fn resume(&self) {
        self.0.resume();
    }
}

/// Streams to the partner's hostname on the shared video port.
pub struct TransportTarget {
    pub handle: TargetHandle,
    pub video_port: u16,
}

impl TargetControl for TransportTarget {
    fn set_target(&self, hostname: &str) {
        self.handle.set(hostname, self.video_port);
    }

    fn clear_target(&self) {
        self.handle.clear();
    }
}
