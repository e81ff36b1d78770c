//! Thread infrastructure for the fusion daemon.
//!
//! Four thread groups:
//! - MQTT event loop: forwards raw payloads into the ingest channel
//!   (spawned by `io::mqtt`)
//! - `IngestPool`: decodes and files observations (one worker per core)
//! - `TickThread`: fixed-rate reduction and publication
//! - monitor: 1 Hz counter report

pub mod ingest;
pub mod monitor;
pub mod tick;

pub use ingest::{IngestContext, IngestPool};
pub use tick::{new_active_keys, ActiveKeys, TickConfig, TickThread};
