//! Core data types for scenes, cells, and observations.

use crate::core::time::Nanos;

/// Number of discrete cell states carried on the wire.
pub const N_STATES: usize = 3;

/// Discrete occupancy state of one grid cell.
///
/// The enumeration order is the fusion tie-break priority: definite
/// evidence wins over abstention, and free wins over occupied on exact
/// ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellState {
    Free,
    Occupied,
    Unknown,
}

impl CellState {
    /// All states in tie-break priority order.
    pub const ALL: [CellState; N_STATES] =
        [CellState::Free, CellState::Occupied, CellState::Unknown];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            CellState::Free => 0,
            CellState::Occupied => 1,
            CellState::Unknown => 2,
        }
    }
}

/// State relation of a cell: a state plus the sender's confidence in it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateRelation {
    pub confidence: f32,
    pub state: CellState,
}

/// Occupant relation of a cell. Carried through fusion untouched; the
/// engine never merges occupant identities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccupantRelation {
    pub confidence: f32,
    pub actor_id: i32,
}

/// One cell of an occupancy grid. `hash` is the packed quadkey at grid
/// level.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub hash: u64,
    pub state: StateRelation,
    pub occupant: Option<OccupantRelation>,
}

/// A decoded occupancy-grid message.
///
/// `timestamp` is the producer's wall time. On fused output,
/// `last_timestamp` is the assembly time and `min_timestamp` /
/// `max_timestamp` bound the source observations that contributed.
#[derive(Debug, Clone, Default)]
pub struct TrafficScene {
    pub timestamp: Nanos,
    pub last_timestamp: Nanos,
    pub min_timestamp: Nanos,
    pub max_timestamp: Nanos,
    pub measured_by: i32,
    pub cells: Vec<GridCell>,
}

/// One sender's measurement of one cell at one point in time.
#[derive(Debug, Clone)]
pub struct CellObservation {
    pub timestamp: Nanos,
    pub sender_id: i32,
    pub cell: GridCell,
}
