//! Wire codec for traffic scenes.
//!
//! The engine treats the codec as opaque: anything that maps bytes to
//! [`TrafficScene`] and back satisfies [`SceneCodec`]. The shipped
//! binding is Protobuf via `prost`, generated from `proto/scene.proto`.
//! Wire timestamps are double-precision seconds; the conversion to the
//! internal nanosecond representation happens here and nowhere else.

use prost::Message;
use thiserror::Error;

use crate::core::time::{nanos_to_secs, secs_to_nanos};
use crate::core::{CellState, GridCell, OccupantRelation, StateRelation, TrafficScene};

// Include generated protobuf types
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/scene.rs"));
}

/// Codec errors.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("encode error: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Pluggable scene serializer.
pub trait SceneCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<TrafficScene>;
    fn encode(&self, scene: &TrafficScene) -> Result<Vec<u8>>;
}

/// Protobuf scene codec.
#[derive(Clone, Default)]
pub struct ProtoSceneCodec;

impl ProtoSceneCodec {
    pub fn new() -> Self {
        Self
    }
}

impl SceneCodec for ProtoSceneCodec {
    fn decode(&self, bytes: &[u8]) -> Result<TrafficScene> {
        let msg = proto::TrafficScene::decode(bytes)?;
        Ok(scene_from_proto(msg))
    }

    fn encode(&self, scene: &TrafficScene) -> Result<Vec<u8>> {
        let msg = scene_to_proto(scene);
        Ok(msg.encode_to_vec())
    }
}

fn scene_from_proto(msg: proto::TrafficScene) -> TrafficScene {
    let cells = msg
        .occupancy_grid
        .map(|grid| grid.cells.into_iter().map(cell_from_proto).collect())
        .unwrap_or_default();

    TrafficScene {
        timestamp: secs_to_nanos(msg.timestamp),
        last_timestamp: secs_to_nanos(msg.last_timestamp),
        min_timestamp: secs_to_nanos(msg.min_timestamp),
        max_timestamp: secs_to_nanos(msg.max_timestamp),
        measured_by: msg.measured_by,
        cells,
    }
}

fn scene_to_proto(scene: &TrafficScene) -> proto::TrafficScene {
    proto::TrafficScene {
        timestamp: nanos_to_secs(scene.timestamp),
        last_timestamp: nanos_to_secs(scene.last_timestamp),
        min_timestamp: nanos_to_secs(scene.min_timestamp),
        max_timestamp: nanos_to_secs(scene.max_timestamp),
        measured_by: scene.measured_by,
        occupancy_grid: Some(proto::OccupancyGrid {
            cells: scene.cells.iter().map(cell_to_proto).collect(),
        }),
    }
}

fn cell_from_proto(cell: proto::GridCell) -> GridCell {
    // A missing or unrecognized state relation reads as unknown at zero
    // confidence rather than fabricating definite evidence.
    let state = cell
        .state
        .map(|rel| StateRelation {
            confidence: rel.confidence,
            state: state_from_proto(rel.object),
        })
        .unwrap_or(StateRelation {
            confidence: 0.0,
            state: CellState::Unknown,
        });

    let occupant = cell.occupant.and_then(|rel| {
        rel.object.map(|actor| OccupantRelation {
            confidence: rel.confidence,
            actor_id: actor.id,
        })
    });

    GridCell {
        hash: cell.hash,
        state,
        occupant,
    }
}

fn cell_to_proto(cell: &GridCell) -> proto::GridCell {
    proto::GridCell {
        hash: cell.hash,
        state: Some(proto::GridCellStateRelation {
            confidence: cell.state.confidence,
            object: state_to_proto(cell.state.state) as i32,
        }),
        occupant: cell.occupant.map(|rel| proto::DynamicActorRelation {
            confidence: rel.confidence,
            object: Some(proto::DynamicActor { id: rel.actor_id }),
        }),
    }
}

fn state_from_proto(raw: i32) -> CellState {
    match proto::GridCellState::try_from(raw) {
        Ok(proto::GridCellState::Free) => CellState::Free,
        Ok(proto::GridCellState::Occupied) => CellState::Occupied,
        _ => CellState::Unknown,
    }
}

fn state_to_proto(state: CellState) -> proto::GridCellState {
    match state {
        CellState::Free => proto::GridCellState::Free,
        CellState::Occupied => proto::GridCellState::Occupied,
        CellState::Unknown => proto::GridCellState::Unknown,
    }
}
