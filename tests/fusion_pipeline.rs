//! Pipeline integration tests: raw payloads through ingest, the
//! observation store, the tick reducer, and back out through the codec.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;

use edgefuse::core::time::{now_nanos, Nanos, NANOS_PER_SEC};
use edgefuse::core::{CellState, GridCell, OccupantRelation, StateRelation, TrafficScene};
use edgefuse::io::{Publisher, TransportError};
use edgefuse::threads::{TickConfig, TickThread};
use edgefuse::{Engine, EngineConfig, ProtoSceneCodec, SceneCodec};

const SECTOR: &str = "1202032332303131";
const CELL: &str = "120203233230313100000100";
const PARENT: &str = "1202032332303131000";
const MAX_AGE: Nanos = 5 * NANOS_PER_SEC;

fn engine() -> Engine {
    Engine::new(
        EngineConfig {
            sector: SECTOR.to_owned(),
            max_age: MAX_AGE,
            max_fusion_workers: 4,
            ..Default::default()
        },
        Arc::new(ProtoSceneCodec::new()),
    )
}

fn scene_bytes(cell_key: &str, sender: i32, ts: Nanos, state: CellState, conf: f32) -> Vec<u8> {
    let scene = TrafficScene {
        timestamp: ts,
        measured_by: sender,
        cells: vec![GridCell {
            hash: edgefuse::core::quadkey::decode_str(cell_key).unwrap(),
            state: StateRelation {
                confidence: conf,
                state,
            },
            occupant: Some(OccupantRelation {
                confidence: 1.0,
                actor_id: sender,
            }),
        }],
        ..Default::default()
    };
    ProtoSceneCodec::new().encode(&scene).unwrap()
}

fn decode(bytes: &[u8]) -> TrafficScene {
    ProtoSceneCodec::new().decode(bytes).unwrap()
}

#[test]
fn single_sender_scene_passes_through() {
    let engine = engine();
    let ingest = engine.ingest_context();
    let reducer = engine.reducer();

    let t0 = now_nanos();
    ingest.handle_at(&scene_bytes(CELL, 1, t0, CellState::Occupied, 0.8), t0);

    let out = reducer.reduce(t0 + NANOS_PER_SEC / 10);
    assert_eq!(out.len(), 1);
    let (parent, bytes) = out.iter().next().unwrap();
    assert_eq!(parent, PARENT);

    let scene = decode(bytes);
    assert_eq!(scene.cells.len(), 1);
    let cell = &scene.cells[0];
    assert_eq!(cell.state.state, CellState::Occupied);
    assert!((cell.state.confidence - 0.8).abs() < 1e-3);
    // The untouched occupant relation rides along.
    assert_eq!(cell.occupant.map(|o| o.actor_id), Some(1));
}

#[test]
fn two_senders_disagreeing_fuse_toward_free() {
    let engine = engine();
    let ingest = engine.ingest_context();
    let reducer = engine.reducer();

    let t0 = now_nanos();
    ingest.handle_at(&scene_bytes(CELL, 1, t0, CellState::Free, 0.9), t0);
    ingest.handle_at(&scene_bytes(CELL, 2, t0, CellState::Occupied, 0.4), t0);

    let out = reducer.reduce(t0);
    assert_eq!(out.len(), 1);
    let scene = decode(out.get(PARENT).expect("parent scene missing"));
    assert_eq!(scene.cells.len(), 1, "one fused cell per grid tile");
    assert_eq!(scene.cells[0].state.state, CellState::Free);
    assert!((scene.cells[0].state.confidence - 0.45).abs() < 1e-3);
}

#[test]
fn stale_scene_never_reaches_the_store() {
    let engine = engine();
    let ingest = engine.ingest_context();
    let reducer = engine.reducer();

    let now = now_nanos();
    let stale_ts = now - 2 * MAX_AGE;
    ingest.handle_at(&scene_bytes(CELL, 1, stale_ts, CellState::Occupied, 0.8), now);

    assert!(engine.store.is_empty());
    assert!(reducer.reduce(now).is_empty());
}

#[test]
fn every_output_cell_sits_under_its_scene_parent() {
    let engine = engine();
    let ingest = engine.ingest_context();
    let reducer = engine.reducer();
    let codec = ProtoSceneCodec::new();
    let quadkeys = Arc::clone(&engine.quadkeys);

    let t0 = now_nanos();
    let cells = [
        format!("{}00000100", SECTOR),
        format!("{}00000101", SECTOR),
        format!("{}30000000", SECTOR),
        format!("{}12300000", SECTOR),
    ];
    for (i, cell_key) in cells.iter().enumerate() {
        ingest.handle_at(
            &scene_bytes(cell_key, i as i32 + 1, t0, CellState::Occupied, 0.7),
            t0,
        );
    }

    let out = reducer.reduce(t0);
    let mut seen = std::collections::HashSet::new();
    for (parent, bytes) in &out {
        assert_eq!(parent.len(), 19);
        let scene = codec.decode(bytes).unwrap();
        assert!(!scene.cells.is_empty());
        for cell in &scene.cells {
            let key = quadkeys.to_string(cell.hash);
            assert!(
                key.starts_with(parent.as_str()),
                "cell {} routed to {}",
                key,
                parent
            );
            assert!(seen.insert(key), "cell appeared in two scenes");
        }
    }
    assert_eq!(seen.len(), cells.len());
}

#[test]
fn only_fresh_observations_contribute() {
    let engine = engine();
    let ingest = engine.ingest_context();
    let reducer = engine.reducer();

    let t0 = now_nanos();
    let fresh_cell = format!("{}00000100", SECTOR);
    let aging_cell = format!("{}00000101", SECTOR);

    // Both land inside the window at ingest time...
    ingest.handle_at(&scene_bytes(&aging_cell, 1, t0, CellState::Occupied, 0.9), t0);
    let later = t0 + MAX_AGE + NANOS_PER_SEC;
    ingest.handle_at(
        &scene_bytes(&fresh_cell, 1, later, CellState::Free, 0.9),
        later,
    );

    // ...but by the next tick only one is still fresh.
    let out = reducer.reduce(later);
    assert_eq!(out.len(), 1);
    let scene = decode(out.values().next().unwrap());
    assert_eq!(scene.cells.len(), 1);
    assert_eq!(scene.cells[0].state.state, CellState::Free);

    // The reducer pass also evicted the aged observation.
    assert_eq!(engine.store.len(), 1);
}

#[test]
fn scene_timestamps_bound_their_sources() {
    let engine = engine();
    let ingest = engine.ingest_context();
    let reducer = engine.reducer();

    // Keep both source timestamps in the past so the assembly time
    // (real wall clock) lands after them.
    let t0 = now_nanos() - 2 * NANOS_PER_SEC;
    let t1 = t0 + NANOS_PER_SEC;
    ingest.handle_at(&scene_bytes(CELL, 1, t0, CellState::Occupied, 0.8), t0);
    ingest.handle_at(
        &scene_bytes("120203233230313100000101", 2, t1, CellState::Free, 0.8),
        t1,
    );

    let out = reducer.reduce(t1);
    let scene = decode(out.get(PARENT).unwrap());

    // Wire round-trip costs sub-microsecond precision.
    let tolerance = 2_000;
    assert!(scene.min_timestamp.abs_diff(t0) < tolerance);
    assert!(scene.max_timestamp.abs_diff(t1) < tolerance);
    assert!(scene.last_timestamp >= scene.max_timestamp);
    assert!(scene.timestamp.abs_diff(t1) < tolerance);
}

struct ChannelPublisher(crossbeam_channel::Sender<(String, Vec<u8>)>);

impl Publisher for ChannelPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.0
            .send((topic.to_owned(), payload))
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

#[test]
fn tick_loop_publishes_on_the_parent_topic_and_stops_promptly() {
    let engine = engine();
    let ingest = engine.ingest_context();
    let running = Arc::new(AtomicBool::new(true));
    let (published_tx, published_rx) = unbounded();

    let tick = TickThread::spawn(
        TickConfig {
            tick_rate: 50.0,
            topic_prefix: "/graph_fused_out".to_owned(),
        },
        engine.reducer(),
        ChannelPublisher(published_tx),
        Arc::clone(&engine.counters),
        engine.active_keys.clone(),
        Arc::clone(&running),
    );

    ingest.handle(&scene_bytes(CELL, 1, now_nanos(), CellState::Occupied, 0.8));

    let (topic, bytes) = published_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("tick loop never published");
    assert_eq!(topic, format!("/graph_fused_out/{}", PARENT));
    let scene = decode(&bytes);
    assert_eq!(scene.cells.len(), 1);

    // Shutdown must complete promptly.
    let started = std::time::Instant::now();
    running.store(false, Ordering::Relaxed);
    tick.join().expect("tick thread panicked");
    assert!(started.elapsed() < Duration::from_millis(500));

    assert!(engine.active_keys.read().contains_key(PARENT));
    let snapshot = engine.counters.snapshot_and_reset();
    assert!(snapshot.out_msgs >= 1);
    assert!(snapshot.out_bytes > 0);
}
