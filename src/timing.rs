//! Named-interval timing service.
//!
//! `start(name)` / `stop(name)` bracket a section; a reporter thread
//! logs mean duration and call rate per section every 5 seconds. Only
//! running aggregates are retained per key, so memory stays constant
//! no matter how long the process runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

struct Aggregate {
    count: u64,
    total: Duration,
    open: Option<Instant>,
    since: Instant,
}

impl Aggregate {
    fn new() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            open: None,
            since: Instant::now(),
        }
    }
}

impl Default for Aggregate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct TimingService {
    sections: Mutex<HashMap<&'static str, Aggregate>>,
}

impl TimingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an interval for `key`. A second `start` before `stop`
    /// restarts the open interval.
    pub fn start(&self, key: &'static str) {
        let mut sections = self.sections.lock();
        sections.entry(key).or_default().open = Some(Instant::now());
    }

    /// Close the open interval for `key`, folding it into the running
    /// aggregate. A `stop` without a matching `start` is ignored.
    pub fn stop(&self, key: &'static str) {
        let mut sections = self.sections.lock();
        if let Some(agg) = sections.get_mut(key) {
            if let Some(started) = agg.open.take() {
                agg.total += started.elapsed();
                agg.count += 1;
            }
        }
    }

    /// Mean duration of completed intervals for `key`.
    pub fn mean(&self, key: &'static str) -> Duration {
        let sections = self.sections.lock();
        match sections.get(key) {
            Some(agg) if agg.count > 0 => agg.total / agg.count as u32,
            _ => Duration::ZERO,
        }
    }

    /// Completed intervals per second since `key` was first started.
    pub fn call_rate(&self, key: &'static str) -> f32 {
        let sections = self.sections.lock();
        match sections.get(key) {
            Some(agg) => {
                let elapsed = agg.since.elapsed().as_secs_f32();
                if elapsed > 0.0 {
                    agg.count as f32 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    /// One report line per section, sorted by key.
    pub fn report(&self) -> String {
        let sections = self.sections.lock();
        let mut keys: Vec<_> = sections.keys().copied().collect();
        keys.sort_unstable();

        let mut out = String::from("timings:");
        for key in keys {
            let agg = &sections[key];
            let mean = if agg.count > 0 {
                agg.total / agg.count as u32
            } else {
                Duration::ZERO
            };
            let elapsed = agg.since.elapsed().as_secs_f32();
            let rate = if elapsed > 0.0 {
                agg.count as f32 / elapsed
            } else {
                0.0
            };
            out.push_str(&format!(" [{}] {:?} ({:.2}/s)", key, mean, rate));
        }
        out
    }

    /// Spawn the 5-second reporter thread.
    pub fn spawn_reporter(timing: Arc<Self>, running: Arc<AtomicBool>) -> JoinHandle<()> {
        thread::Builder::new()
            .name("timing".into())
            .spawn(move || {
                let mut last_report = Instant::now();
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(100));
                    if last_report.elapsed() >= REPORT_INTERVAL {
                        log::info!("{}", timing.report());
                        last_report = Instant::now();
                    }
                }
            })
            .expect("Failed to spawn timing thread")
    }
}
