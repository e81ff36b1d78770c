//! Tick reducer: turns the observation store into one encoded scene per
//! remote tile.
//!
//! Each tick walks three phases over a snapshot of the store:
//!
//! 1. **Partition** — group fresh observations by remote-tile parent,
//!    then by cell, and allocate one output skeleton per parent sized
//!    from the present-cells index.
//! 2. **Fuse** — dispatch one job per distinct cell to the fixed fusion
//!    worker pool and drain the results channel, tracking per-parent
//!    timestamp bounds. A worker panic is caught at the job boundary
//!    and costs exactly that cell.
//! 3. **Assemble** — stamp scene timestamps, encode, and hand the
//!    per-parent payloads back to the tick loop.
//!
//! The per-tick scenes are owned by the reducer alone; workers only
//! ever touch the observations handed to them in their job and report
//! back over the results channel.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::core::quadkey;
use crate::core::time::{now_nanos, Nanos};
use crate::core::{CellObservation, TrafficScene};
use crate::fusion::cell::{fuse_cell, FusedCell};
use crate::io::codec::SceneCodec;
use crate::store::ObservationStore;
use crate::timing::TimingService;

/// Reducer tuning. Levels and sector are fixed at startup.
#[derive(Debug, Clone)]
pub struct ReducerConfig {
    /// Quadkey of the sector this node owns.
    pub sector: String,
    /// Zoom level of outbound routing tiles.
    pub remote_tile_level: usize,
    /// Zoom level of individual occupancy cells.
    pub grid_tile_level: usize,
    /// Exponential decay constant per 100 ms of observation age.
    pub decay_lambda: f64,
    /// Sliding-window width; older observations are ignored and evicted.
    pub max_age: Nanos,
    /// Cap on fusion worker threads. The natural pool size is
    /// 4^(grid - remote) jobs per parent; beyond the cap, cells queue.
    pub max_workers: usize,
    /// Identity stamped into outbound scenes.
    pub node_id: i32,
}

impl ReducerConfig {
    /// Worker pool size: one thread per possible cell under a remote
    /// tile, bounded by `max_workers`.
    fn pool_size(&self) -> usize {
        let delta = self.grid_tile_level.saturating_sub(self.remote_tile_level);
        let natural = 4usize.saturating_pow(delta.min(16) as u32);
        natural.clamp(1, self.max_workers.max(1))
    }
}

struct FusionJob {
    parent: String,
    hash: u64,
    observations: Vec<CellObservation>,
    now: Nanos,
}

struct FusionOutcome {
    parent: String,
    fused: Option<FusedCell>,
}

struct SceneBuild {
    cells: Vec<FusedCell>,
    min_timestamp: Nanos,
    max_timestamp: Nanos,
}

pub struct FusionReducer {
    cfg: ReducerConfig,
    store: Arc<ObservationStore>,
    codec: Arc<dyn SceneCodec>,
    timing: Arc<TimingService>,
    job_tx: Option<Sender<FusionJob>>,
    outcome_rx: Receiver<FusionOutcome>,
    workers: Vec<JoinHandle<()>>,
}

impl FusionReducer {
    /// Create the reducer and spawn its fusion worker pool.
    pub fn new(
        cfg: ReducerConfig,
        store: Arc<ObservationStore>,
        codec: Arc<dyn SceneCodec>,
        timing: Arc<TimingService>,
    ) -> Self {
        let pool_size = cfg.pool_size();
        let (job_tx, job_rx) = bounded::<FusionJob>(pool_size * 2);
        let (outcome_tx, outcome_rx) = bounded::<FusionOutcome>(pool_size * 2);

        let lambda = cfg.decay_lambda;
        let mut workers = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let job_rx = job_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("fusion-{}", i))
                .spawn(move || run_fusion_worker(job_rx, outcome_tx, lambda))
                .expect("Failed to spawn fusion worker");
            workers.push(handle);
        }

        log::info!("Fusion pool started ({} workers)", pool_size);

        Self {
            cfg,
            store,
            codec,
            timing,
            job_tx: Some(job_tx),
            outcome_rx,
            workers,
        }
    }

    /// Run one reduction pass. Returns the encoded scene per remote
    /// tile that had at least one fresh cell; empty map when the window
    /// holds nothing.
    pub fn reduce(&self, now: Nanos) -> BTreeMap<String, Vec<u8>> {
        // Phase A: partition fresh observations by parent and cell.
        self.timing.start("reduce.partition");
        let mut buckets: HashMap<String, HashMap<u64, Vec<CellObservation>>> = HashMap::new();

        for (cell_key, obs) in self.store.snapshot() {
            if now.saturating_sub(obs.timestamp) > self.cfg.max_age {
                continue;
            }
            if cell_key.len() != self.cfg.grid_tile_level
                || !cell_key.starts_with(&self.cfg.sector)
            {
                continue;
            }
            let parent = quadkey::parent(&cell_key, self.cfg.remote_tile_level).to_owned();
            buckets
                .entry(parent)
                .or_default()
                .entry(obs.cell.hash)
                .or_default()
                .push(obs);
        }

        let mut scenes: HashMap<String, SceneBuild> = HashMap::with_capacity(buckets.len());
        for parent in buckets.keys() {
            let capacity = self.store.sweep(parent, now, self.cfg.max_age);
            scenes.insert(
                parent.clone(),
                SceneBuild {
                    cells: Vec::with_capacity(capacity),
                    min_timestamp: Nanos::MAX,
                    max_timestamp: 0,
                },
            );
        }
        self.timing.stop("reduce.partition");

        // Phase B: fan cells out to the pool and drain every outcome.
        self.timing.start("reduce.fuse");
        let mut outstanding: usize = 0;
        if let Some(job_tx) = &self.job_tx {
            'dispatch: for (parent, cells) in buckets {
                for (hash, observations) in cells {
                    let mut job = FusionJob {
                        parent: parent.clone(),
                        hash,
                        observations,
                        now,
                    };
                    // Keep the results channel drained while the job
                    // channel is full, or dispatch and drain deadlock.
                    loop {
                        match job_tx.try_send(job) {
                            Ok(()) => break,
                            Err(crossbeam_channel::TrySendError::Full(returned)) => {
                                job = returned;
                                if self.drain_one(&mut scenes) {
                                    outstanding -= 1;
                                } else {
                                    break 'dispatch;
                                }
                            }
                            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                                log::error!("Fusion pool gone, aborting dispatch");
                                break 'dispatch;
                            }
                        }
                    }
                    outstanding += 1;
                }
            }
        }

        while outstanding > 0 {
            if self.drain_one(&mut scenes) {
                outstanding -= 1;
            } else {
                break;
            }
        }
        self.timing.stop("reduce.fuse");

        // Stale observations were skipped above; drop them for good.
        self.store.evict_expired(now, self.cfg.max_age);

        // Phase C: assemble and encode one scene per parent.
        self.timing.start("reduce.assemble");
        let mut out = BTreeMap::new();
        for (parent, build) in scenes {
            if build.cells.is_empty() {
                continue;
            }
            let scene = TrafficScene {
                timestamp: now,
                last_timestamp: now_nanos(),
                min_timestamp: build.min_timestamp,
                max_timestamp: build.max_timestamp,
                measured_by: self.cfg.node_id,
                cells: build.cells.into_iter().map(|f| f.cell).collect(),
            };
            match self.codec.encode(&scene) {
                Ok(bytes) => {
                    out.insert(parent, bytes);
                }
                Err(e) => {
                    log::error!("Encode failed for {}: {}", parent, e);
                }
            }
        }
        self.timing.stop("reduce.assemble");

        out
    }

    /// Receive one fusion outcome and fold it into its parent's build.
    /// Returns false if the pool is gone.
    fn drain_one(&self, scenes: &mut HashMap<String, SceneBuild>) -> bool {
        match self.outcome_rx.recv() {
            Ok(outcome) => {
                if let Some(fused) = outcome.fused {
                    if let Some(build) = scenes.get_mut(&outcome.parent) {
                        build.min_timestamp = build.min_timestamp.min(fused.min_timestamp);
                        build.max_timestamp = build.max_timestamp.max(fused.max_timestamp);
                        build.cells.push(fused);
                    }
                }
                true
            }
            Err(_) => {
                log::error!("Fusion results channel closed");
                false
            }
        }
    }
}

impl Drop for FusionReducer {
    fn drop(&mut self) {
        // Closing the job channel stops the pool.
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            handle.join().ok();
        }
    }
}

fn run_fusion_worker(
    job_rx: Receiver<FusionJob>,
    outcome_tx: Sender<FusionOutcome>,
    lambda: f64,
) {
    while let Ok(job) = job_rx.recv() {
        let fused = panic::catch_unwind(AssertUnwindSafe(|| {
            fuse_cell(job.hash, &job.observations, job.now, lambda)
        }));

        let fused = match fused {
            Ok(cell) => Some(cell),
            Err(_) => {
                log::warn!("Cell fusion panicked for hash {:#x}, cell dropped", job.hash);
                None
            }
        };

        if outcome_tx
            .send(FusionOutcome {
                parent: job.parent,
                fused,
            })
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::NANOS_PER_SEC;
    use crate::core::{CellState, GridCell, StateRelation};
    use crate::io::codec::{ProtoSceneCodec, SceneCodec};

    const SECTOR: &str = "1202032332303131";

    fn reducer(store: Arc<ObservationStore>) -> FusionReducer {
        FusionReducer::new(
            ReducerConfig {
                sector: SECTOR.to_owned(),
                remote_tile_level: 19,
                grid_tile_level: 24,
                decay_lambda: 0.05,
                max_age: 5 * NANOS_PER_SEC,
                max_workers: 4,
                node_id: 0,
            },
            store,
            Arc::new(ProtoSceneCodec::new()),
            Arc::new(TimingService::new()),
        )
    }

    fn put_cell(store: &ObservationStore, cell_key: &str, sender: i32, ts: Nanos, conf: f32) {
        let hash = crate::core::quadkey::decode_str(cell_key).unwrap();
        store.observe_latest(cell_key, ts);
        store.put(
            cell_key,
            sender,
            CellObservation {
                timestamp: ts,
                sender_id: sender,
                cell: GridCell {
                    hash,
                    state: StateRelation {
                        confidence: conf,
                        state: CellState::Occupied,
                    },
                    occupant: None,
                },
            },
        );
    }

    #[test]
    fn empty_store_reduces_to_empty_map() {
        let store = Arc::new(ObservationStore::new());
        let reducer = reducer(Arc::clone(&store));
        assert!(reducer.reduce(10 * NANOS_PER_SEC).is_empty());
    }

    #[test]
    fn cells_route_to_their_remote_parent() {
        let store = Arc::new(ObservationStore::new());
        let reducer = reducer(Arc::clone(&store));

        let now = 10 * NANOS_PER_SEC;
        let key_a = format!("{}00000100", SECTOR);
        let key_b = format!("{}30000000", SECTOR);
        put_cell(&store, &key_a, 1, now, 0.8);
        put_cell(&store, &key_b, 1, now, 0.6);

        let out = reducer.reduce(now);
        assert_eq!(out.len(), 2);
        for (parent, bytes) in &out {
            assert_eq!(parent.len(), 19);
            assert!(parent.starts_with(SECTOR));
            let scene = ProtoSceneCodec::new().decode(bytes).unwrap();
            assert_eq!(scene.cells.len(), 1);
        }
    }

    #[test]
    fn observations_outside_the_sector_are_ignored() {
        let store = Arc::new(ObservationStore::new());
        let reducer = reducer(Arc::clone(&store));

        let now = 10 * NANOS_PER_SEC;
        put_cell(&store, "220203233230313100000100", 1, now, 0.8);
        assert!(reducer.reduce(now).is_empty());
    }

    #[test]
    fn stale_observations_are_skipped_and_evicted() {
        let store = Arc::new(ObservationStore::new());
        let reducer = reducer(Arc::clone(&store));

        let now = 100 * NANOS_PER_SEC;
        let key = format!("{}00000100", SECTOR);
        put_cell(&store, &key, 1, now - 50 * NANOS_PER_SEC, 0.8);

        assert!(reducer.reduce(now).is_empty());
        assert!(store.is_empty(), "stale observation must be evicted");
    }

    #[test]
    fn two_senders_fuse_into_one_cell() {
        let store = Arc::new(ObservationStore::new());
        let reducer = reducer(Arc::clone(&store));

        let now = 10 * NANOS_PER_SEC;
        let key = format!("{}00000100", SECTOR);
        put_cell(&store, &key, 1, now, 0.8);
        put_cell(&store, &key, 2, now, 0.6);

        let out = reducer.reduce(now);
        assert_eq!(out.len(), 1);
        let (parent, bytes) = out.iter().next().unwrap();
        assert_eq!(parent.as_str(), &key[..19]);

        let scene = ProtoSceneCodec::new().decode(bytes).unwrap();
        assert_eq!(scene.cells.len(), 1);
        assert_eq!(scene.cells[0].state.state, CellState::Occupied);
        // Same state from both senders: mean stays the average.
        assert!((scene.cells[0].state.confidence - 0.7).abs() < 1e-3);
    }
}
