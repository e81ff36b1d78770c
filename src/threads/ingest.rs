//! Ingest pipeline - decodes raw payloads into the observation store.
//!
//! A fixed pool of workers (one per CPU core by default) drains the
//! bounded payload channel filled by the transport. Each payload is
//! decoded, freshness-checked against the scene timestamp, and filed
//! cell by cell. The channel bound is the backpressure boundary: the
//! transport blocks when ingest falls behind, and the freshness check
//! here sheds whatever queued up too long.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::core::time::{now_nanos, Nanos, NANOS_PER_SEC};
use crate::core::{CellObservation, QuadKeyCache};
use crate::io::codec::SceneCodec;
use crate::metrics::Counters;
use crate::store::ObservationStore;

/// Everything one ingest worker needs to file a payload.
pub struct IngestContext {
    pub store: Arc<ObservationStore>,
    pub codec: Arc<dyn SceneCodec>,
    pub quadkeys: Arc<QuadKeyCache>,
    pub counters: Arc<Counters>,
    /// Scenes older than this on arrival are dropped outright.
    pub max_age: Nanos,
}

impl IngestContext {
    /// Process one raw payload against the wall clock.
    pub fn handle(&self, payload: &[u8]) {
        self.handle_at(payload, now_nanos());
    }

    /// Process one raw payload as of `now`.
    pub fn handle_at(&self, payload: &[u8], now: Nanos) {
        self.counters.record_input(payload.len());

        let scene = match self.codec.decode(payload) {
            Ok(scene) => scene,
            Err(e) => {
                log::error!("Dropping undecodable payload ({} bytes): {}", payload.len(), e);
                return;
            }
        };

        // Shedding point under backpressure: whatever aged out while
        // queued dies here instead of polluting the store.
        let age = now.saturating_sub(scene.timestamp);
        if age > self.max_age {
            log::info!(
                "Dropping stale scene from sender {} ({:.1}s old)",
                scene.measured_by,
                age as f64 / NANOS_PER_SEC as f64
            );
            return;
        }

        if scene.cells.is_empty() {
            log::error!("Dropping empty scene from sender {}", scene.measured_by);
            return;
        }

        for cell in scene.cells {
            let cell_key = self.quadkeys.to_string(cell.hash);
            self.store.observe_latest(&cell_key, scene.timestamp);
            self.store.put(
                &cell_key,
                scene.measured_by,
                CellObservation {
                    timestamp: scene.timestamp,
                    sender_id: scene.measured_by,
                    cell,
                },
            );
        }
    }
}

/// Handle for the ingest worker pool.
pub struct IngestPool {
    handles: Vec<JoinHandle<()>>,
}

impl IngestPool {
    /// Spawn `workers` ingest threads draining `payload_rx`.
    pub fn spawn(
        workers: usize,
        payload_rx: Receiver<Vec<u8>>,
        context: Arc<IngestContext>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers);

        for i in 0..workers {
            let payload_rx = payload_rx.clone();
            let context = Arc::clone(&context);
            let running = Arc::clone(&running);
            let handle = thread::Builder::new()
                .name(format!("ingest-{}", i))
                .spawn(move || run_ingest_worker(payload_rx, context, running))
                .expect("Failed to spawn ingest worker");
            handles.push(handle);
        }

        log::info!("Ingest pool started ({} workers)", workers);
        Self { handles }
    }

    /// Wait for all workers to finish.
    pub fn join(self) {
        for handle in self.handles {
            handle.join().ok();
        }
    }
}

fn run_ingest_worker(
    payload_rx: Receiver<Vec<u8>>,
    context: Arc<IngestContext>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match payload_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(payload) => context.handle(&payload),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
