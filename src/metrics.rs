//! Throughput counters.
//!
//! Plain atomics, reset by the monitor at each report. Safe to bump
//! from any thread on the hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct Counters {
    in_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_msgs: AtomicU64,
    out_bytes: AtomicU64,
    fusion_nanos: AtomicU64,
    fused_ticks: AtomicU64,
}

/// Counter values captured at one monitor interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_msgs: u64,
    pub out_bytes: u64,
    pub fusion_nanos: u64,
    pub fused_ticks: u64,
}

impl Snapshot {
    /// Mean fusion time over the ticks that produced output.
    pub fn avg_fusion(&self) -> Duration {
        if self.fused_ticks == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.fusion_nanos / self.fused_ticks)
    }
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_input(&self, bytes: usize) {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_output(&self, bytes: usize) {
        self.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_fusion(&self, elapsed: Duration) {
        self.fusion_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.fused_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and zero all counters.
    pub fn snapshot_and_reset(&self) -> Snapshot {
        Snapshot {
            in_msgs: self.in_msgs.swap(0, Ordering::Relaxed),
            in_bytes: self.in_bytes.swap(0, Ordering::Relaxed),
            out_msgs: self.out_msgs.swap(0, Ordering::Relaxed),
            out_bytes: self.out_bytes.swap(0, Ordering::Relaxed),
            fusion_nanos: self.fusion_nanos.swap(0, Ordering::Relaxed),
            fused_ticks: self.fused_ticks.swap(0, Ordering::Relaxed),
        }
    }
}
