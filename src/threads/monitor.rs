//! Monitor thread - 1 Hz throughput report.
//!
//! Snapshots and resets the counters every second, logging message and
//! byte rates, mean fusion time, and the remote tiles published within
//! the freshness window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::time::{now_nanos, Nanos};
use crate::metrics::{Counters, Snapshot};
use crate::threads::tick::ActiveKeys;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the monitor thread.
pub fn spawn(
    counters: Arc<Counters>,
    active_keys: ActiveKeys,
    max_age: Nanos,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("monitor".into())
        .spawn(move || run_monitor(counters, active_keys, max_age, running))
        .expect("Failed to spawn monitor thread")
}

fn run_monitor(
    counters: Arc<Counters>,
    active_keys: ActiveKeys,
    max_age: Nanos,
    running: Arc<AtomicBool>,
) {
    let mut last_eval = Instant::now();

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
        if last_eval.elapsed() < REPORT_INTERVAL {
            continue;
        }

        let tdelta = last_eval.elapsed().as_secs_f32();
        last_eval = Instant::now();

        let snapshot = counters.snapshot_and_reset();
        log::info!("{}", format_rates(&snapshot, tdelta));

        let active = collect_active(&active_keys, now_nanos(), max_age);
        log::info!("Active: [{}]", active.join(", "));
    }
}

fn format_rates(snapshot: &Snapshot, tdelta: f32) -> String {
    format!(
        "In: {:.1} msg/s {:.0} B/s, Out: {:.1} msg/s {:.0} B/s, Avg fusion: {:?}",
        snapshot.in_msgs as f32 / tdelta,
        snapshot.in_bytes as f32 / tdelta,
        snapshot.out_msgs as f32 / tdelta,
        snapshot.out_bytes as f32 / tdelta,
        snapshot.avg_fusion(),
    )
}

/// Remote tiles published within `max_age`, sorted. Entries older than
/// the window are pruned so the map cannot grow with shifting traffic.
fn collect_active(active_keys: &ActiveKeys, now: Nanos, max_age: Nanos) -> Vec<String> {
    let mut keys = active_keys.write();
    keys.retain(|_, published| now.saturating_sub(*published) <= max_age);
    let mut active: Vec<String> = keys.keys().cloned().collect();
    active.sort_unstable();
    active
}
