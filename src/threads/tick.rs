//! Tick loop - fixed-rate reduction and publication.
//!
//! A single thread owns the reducer. Each iteration sleeps out the
//! remainder of the tick period, runs one reduction, and publishes the
//! per-parent payloads. There is no catch-up: a slow tick just starts
//! the next one immediately, so a long pause never floods the broker
//! with stale output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::core::time::{now_nanos, Nanos};
use crate::fusion::FusionReducer;
use crate::io::Publisher;
use crate::metrics::Counters;

/// Remote tiles published recently, with their last publication time.
/// Read by the monitor for the active-keys report.
pub type ActiveKeys = Arc<RwLock<HashMap<String, Nanos>>>;

pub fn new_active_keys() -> ActiveKeys {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Tick loop configuration.
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Target reductions per second.
    pub tick_rate: f64,
    /// Output topic prefix; the remote tile key is appended.
    pub topic_prefix: String,
}

/// Tick thread handle.
pub struct TickThread {
    handle: JoinHandle<()>,
}

impl TickThread {
    /// Spawn the tick thread. Takes sole ownership of the reducer.
    pub fn spawn<P: Publisher>(
        config: TickConfig,
        reducer: FusionReducer,
        publisher: P,
        counters: Arc<Counters>,
        active_keys: ActiveKeys,
        running: Arc<AtomicBool>,
    ) -> Self {
        let handle = thread::Builder::new()
            .name("tick".into())
            .spawn(move || {
                run_tick_loop(config, reducer, publisher, counters, active_keys, running)
            })
            .expect("Failed to spawn tick thread");

        Self { handle }
    }

    /// Wait for thread to finish.
    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

fn run_tick_loop<P: Publisher>(
    config: TickConfig,
    reducer: FusionReducer,
    publisher: P,
    counters: Arc<Counters>,
    active_keys: ActiveKeys,
    running: Arc<AtomicBool>,
) {
    let period = Duration::from_secs_f64(1.0 / config.tick_rate.max(0.001));
    log::info!(
        "Tick loop starting ({:.1} Hz, prefix {})",
        config.tick_rate,
        config.topic_prefix
    );

    let mut last_tick = Instant::now() - period;

    while running.load(Ordering::Relaxed) {
        // Sleep out the rest of the period in short slices so shutdown
        // stays prompt even at low tick rates.
        while running.load(Ordering::Relaxed) {
            let elapsed = last_tick.elapsed();
            if elapsed >= period {
                break;
            }
            thread::sleep((period - elapsed).min(Duration::from_millis(100)));
        }
        if !running.load(Ordering::Relaxed) {
            break;
        }

        last_tick = Instant::now();
        let now = now_nanos();

        let scenes = reducer.reduce(now);
        if scenes.is_empty() {
            continue;
        }

        for (parent, payload) in scenes {
            let topic = format!("{}/{}", config.topic_prefix, parent);
            let bytes = payload.len();
            match publisher.publish(&topic, payload) {
                Ok(()) => {
                    counters.record_output(bytes);
                    active_keys.write().insert(parent, now);
                }
                Err(e) => {
                    log::error!("Publish failed on {}: {}", topic, e);
                }
            }
        }

        counters.record_fusion(last_tick.elapsed());
    }

    log::info!("Tick loop shutting down");
}
