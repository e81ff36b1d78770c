//! edgefuse - edge fusion daemon for distributed traffic sensing.
//!
//! Vehicles publish occupancy-grid observations of whatever they can
//! see; this node owns one geographic sector, fuses overlapping cell
//! observations across senders over a sliding time window, and
//! republishes one consolidated grid per remote tile at a fixed tick
//! rate.
//!
//! # Architecture
//!
//! The crate is organized into layers, leaves first:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  threads/                   │  ← ingest pool, tick loop, monitor
//! └─────────────────────────────────────────────┘
//!                       │
//! ┌─────────────────────────────────────────────┐
//! │              engine / fusion/               │  ← reducer, per-cell fusion
//! └─────────────────────────────────────────────┘
//!                       │
//! ┌─────────────────────────────────────────────┐
//! │             store/    io/                   │  ← observation store, codec, MQTT
//! └─────────────────────────────────────────────┘
//!                       │
//! ┌─────────────────────────────────────────────┐
//! │                   core/                     │  ← quadkey codec, types, time
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Data flow: transport → ingest queue → ingest workers → observation
//! store → (tick) reducer → transport.

// Layer 1: Core foundation (no internal deps)
pub mod core;

// Layer 2: Shared observation state
pub mod store;

// Layer 3: I/O boundary (codec + transport)
pub mod io;

// Layer 4: Fusion engine
pub mod fusion;

// Layer 5: Observability
pub mod metrics;
pub mod timing;

// Layer 6: Engine assembly + thread infrastructure
pub mod engine;
pub mod threads;

// Convenience re-exports
pub use engine::{Engine, EngineConfig};
pub use fusion::{FusionReducer, ReducerConfig};
pub use io::{MqttConfig, MqttTransport, ProtoSceneCodec, SceneCodec};
pub use store::ObservationStore;
