//! Fusion engine: per-cell state estimation and the tick reducer.

pub mod cell;
pub mod reducer;

pub use cell::{decay_weight, fuse_cell, FusedCell};
pub use reducer::{FusionReducer, ReducerConfig};
