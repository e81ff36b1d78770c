//! Per-cell fusion: time-decayed weighted combination of one cell's
//! observations into a single (state, confidence) pair.

use crate::core::time::{Nanos, NANOS_PER_MILLI};
use crate::core::{CellObservation, CellState, GridCell, StateRelation, N_STATES};

/// A fused cell plus the timestamp bounds of its contributing
/// observations, for scene-level min/max tracking.
#[derive(Debug, Clone)]
pub struct FusedCell {
    pub cell: GridCell,
    pub min_timestamp: Nanos,
    pub max_timestamp: Nanos,
}

/// Exponential age decay. `dt` in 100 ms units; computed in double
/// precision, consumers cast down to accumulate in single precision.
pub fn decay_weight(now: Nanos, timestamp: Nanos, lambda: f64) -> f64 {
    let dt_ms = now.saturating_sub(timestamp) as f64 / NANOS_PER_MILLI as f64;
    (-lambda * dt_ms / 100.0).exp()
}

/// Fuse one cell's observations.
///
/// Weighted sums accumulate per state; any positive evidence for a
/// definite state suppresses the unknown bucket entirely. The result is
/// the argmax of the mean vector, ties broken in [`CellState::ALL`]
/// order. An empty or fully-suppressed input yields unknown at
/// confidence zero.
///
/// The occupant relation is not fused: the newest contributing
/// observation that carries one passes through unchanged.
pub fn fuse_cell(hash: u64, observations: &[CellObservation], now: Nanos, lambda: f64) -> FusedCell {
    let mut sums = [0f32; N_STATES];
    let mut weights = [0f32; N_STATES];

    let mut min_timestamp = Nanos::MAX;
    let mut max_timestamp = 0;
    let mut occupant = None;
    let mut occupant_ts = 0;

    for obs in observations {
        let weight = decay_weight(now, obs.timestamp, lambda) as f32;
        let idx = obs.cell.state.state.index();
        sums[idx] += obs.cell.state.confidence * weight;
        weights[idx] += weight;

        min_timestamp = min_timestamp.min(obs.timestamp);
        max_timestamp = max_timestamp.max(obs.timestamp);

        if obs.cell.occupant.is_some() && obs.timestamp >= occupant_ts {
            occupant = obs.cell.occupant;
            occupant_ts = obs.timestamp;
        }
    }

    // Definite evidence dominates abstention.
    let unknown = CellState::Unknown.index();
    if sums[CellState::Free.index()] > 0.0 || sums[CellState::Occupied.index()] > 0.0 {
        sums[unknown] = 0.0;
        weights[unknown] = 0.0;
    }

    let total_weight: f32 = weights.iter().sum();

    let state = if total_weight > 0.0 {
        let mut best = CellState::ALL[0];
        let mut best_mean = sums[0] / total_weight;
        for state in CellState::ALL.iter().skip(1) {
            let mean = sums[state.index()] / total_weight;
            if mean > best_mean {
                best = *state;
                best_mean = mean;
            }
        }
        StateRelation {
            confidence: best_mean,
            state: best,
        }
    } else {
        StateRelation {
            confidence: 0.0,
            state: CellState::Unknown,
        }
    };

    FusedCell {
        cell: GridCell {
            hash,
            state,
            occupant,
        },
        min_timestamp: if min_timestamp == Nanos::MAX { 0 } else { min_timestamp },
        max_timestamp,
    }
}
