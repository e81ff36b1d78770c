//! Core foundation: quadkey codec, scene types, time representation.

pub mod quadkey;
pub mod time;
pub mod types;

pub use quadkey::{QuadKeyCache, QuadKeyError};
pub use time::{now_nanos, Nanos};
pub use types::{
    CellObservation, CellState, GridCell, OccupantRelation, StateRelation, TrafficScene, N_STATES,
};
