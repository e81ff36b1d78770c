//! Engine assembly.
//!
//! All shared mutable state lives behind this one value, created by
//! startup code and handed into the worker threads explicitly. Nothing
//! in the crate keeps module-scope state.

use std::sync::Arc;

use crate::core::time::{Nanos, NANOS_PER_SEC};
use crate::core::QuadKeyCache;
use crate::fusion::{FusionReducer, ReducerConfig};
use crate::io::codec::SceneCodec;
use crate::metrics::Counters;
use crate::store::ObservationStore;
use crate::threads::ingest::IngestContext;
use crate::threads::{new_active_keys, ActiveKeys};
use crate::timing::TimingService;

/// Engine tuning, assembled from config and CLI by startup code.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Quadkey of the sector this node owns.
    pub sector: String,
    /// Zoom level of individual occupancy cells.
    pub grid_tile_level: usize,
    /// Zoom level of outbound routing tiles.
    pub remote_tile_level: usize,
    /// Exponential decay constant per 100 ms of observation age.
    pub decay_lambda: f64,
    /// Sliding observation window.
    pub max_age: Nanos,
    /// Cap on fusion worker threads.
    pub max_fusion_workers: usize,
    /// Bound on each quadkey memo cache direction.
    pub quadkey_cache_capacity: usize,
    /// Identity stamped into outbound scenes.
    pub node_id: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sector: String::new(),
            grid_tile_level: 24,
            remote_tile_level: 19,
            decay_lambda: 0.05,
            max_age: 5 * NANOS_PER_SEC,
            max_fusion_workers: 32,
            quadkey_cache_capacity: 65_536,
            node_id: 0,
        }
    }
}

/// Shared state of one fusion node.
pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<ObservationStore>,
    pub quadkeys: Arc<QuadKeyCache>,
    pub codec: Arc<dyn SceneCodec>,
    pub counters: Arc<Counters>,
    pub timing: Arc<TimingService>,
    pub active_keys: ActiveKeys,
}

impl Engine {
    pub fn new(config: EngineConfig, codec: Arc<dyn SceneCodec>) -> Self {
        let quadkeys = Arc::new(QuadKeyCache::new(config.quadkey_cache_capacity));
        Self {
            config,
            store: Arc::new(ObservationStore::new()),
            quadkeys,
            codec,
            counters: Arc::new(Counters::new()),
            timing: Arc::new(TimingService::new()),
            active_keys: new_active_keys(),
        }
    }

    /// Context handed to each ingest worker.
    pub fn ingest_context(&self) -> Arc<IngestContext> {
        Arc::new(IngestContext {
            store: Arc::clone(&self.store),
            codec: Arc::clone(&self.codec),
            quadkeys: Arc::clone(&self.quadkeys),
            counters: Arc::clone(&self.counters),
            max_age: self.config.max_age,
        })
    }

    /// Build the reducer and its fusion worker pool.
    pub fn reducer(&self) -> FusionReducer {
        FusionReducer::new(
            ReducerConfig {
                sector: self.config.sector.clone(),
                remote_tile_level: self.config.remote_tile_level,
                grid_tile_level: self.config.grid_tile_level,
                decay_lambda: self.config.decay_lambda,
                max_age: self.config.max_age,
                max_workers: self.config.max_fusion_workers,
                node_id: self.config.node_id,
            },
            Arc::clone(&self.store),
            Arc::clone(&self.codec),
            Arc::clone(&self.timing),
        )
    }
}
