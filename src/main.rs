//! edgefuse - edge fusion daemon for distributed traffic sensing.
//!
//! Subscribes to raw occupancy-grid scenes, fuses overlapping cell
//! observations across senders over a sliding window, and republishes
//! one consolidated scene per remote tile of its sector at a fixed
//! tick rate.
//!
//! # Usage
//!
//! ```bash
//! # Minimal: sector tile is required
//! edgefuse --tile 1202032332303131
//!
//! # Custom broker and config file
//! edgefuse --tile 1202032332303131 --broker tcp://broker.lan:1883 --config edgefuse.toml
//! ```
//!
//! # Threads
//!
//! The daemon runs with four thread groups:
//! - MQTT event loop: forwards raw payloads into the ingest queue
//! - Ingest workers (one per core): decode and file observations
//! - Tick thread: fixed-rate fusion and publication
//! - Monitor + timing threads: 1 Hz rates, 5 s section timings

use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use serde::Deserialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use edgefuse::core::time::NANOS_PER_SEC;
use edgefuse::io::mqtt;
use edgefuse::threads::{monitor, IngestPool, TickConfig, TickThread};
use edgefuse::timing::TimingService;
use edgefuse::{Engine, EngineConfig, MqttConfig, MqttTransport, ProtoSceneCodec};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    node: NodeConfig,
    #[serde(default)]
    fusion: FusionConfig,
    #[serde(default)]
    transport: TransportConfig,
    #[serde(default)]
    cache: CacheConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct NodeConfig {
    /// Identity stamped into outbound scenes.
    id: i32,
    /// Sector quadkey; usually given via --tile instead.
    tile: String,
    /// Broker URL; usually given via --broker instead.
    broker: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            tile: String::new(),
            broker: "tcp://localhost:1883".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FusionConfig {
    /// Reductions per second.
    tick_rate: f64,
    /// Zoom level of individual occupancy cells.
    grid_tile_level: usize,
    /// Zoom level of outbound routing tiles.
    remote_tile_level: usize,
    /// Exponential decay constant per 100 ms of observation age.
    decay_lambda: f64,
    /// Sliding observation window in seconds.
    max_age_secs: f64,
    /// Cap on fusion worker threads.
    max_workers: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            tick_rate: 10.0,
            grid_tile_level: 24,
            remote_tile_level: 19,
            decay_lambda: 0.05,
            max_age_secs: 5.0,
            max_workers: 32,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TransportConfig {
    /// MQTT QoS for subscriptions and publications (0..=2).
    qos: u8,
    /// Client identifier presented to the broker.
    client_id: String,
    /// Raw scene input topic.
    topic_in: String,
    /// Fused scene output topic prefix.
    topic_out_prefix: String,
    /// Ingest queue capacity; the backpressure boundary.
    ingest_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            qos: 1,
            client_id: "edgefuse".to_string(),
            topic_in: "/graph_raw_in".to_string(),
            topic_out_prefix: "/graph_fused_out".to_string(),
            ingest_queue: 256,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CacheConfig {
    /// Bound on each quadkey memo cache direction.
    quadkey_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            quadkey_capacity: 65_536,
        }
    }
}

// ============================================================================
// CLI Arguments
// ============================================================================

struct Args {
    tile: Option<String>,
    broker: Option<String>,
    config_path: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        tile: None,
        broker: None,
        config_path: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--tile" | "-t" => {
                if i + 1 < args.len() {
                    result.tile = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--broker" | "-b" => {
                if i + 1 < args.len() {
                    result.broker = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    result.config_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    result
}

fn print_help() {
    println!("edgefuse - edge fusion daemon for distributed traffic sensing");
    println!();
    println!("USAGE:");
    println!("    edgefuse --tile <QUADKEY> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -t, --tile <QUADKEY>    Sector quadkey this node owns (required)");
    println!("    -b, --broker <URL>      MQTT broker URL (default: tcp://localhost:1883)");
    println!("    -c, --config <FILE>     Configuration file (default: edgefuse.toml)");
    println!("    -h, --help              Print help information");
    println!();
    println!("CONFIGURATION:");
    println!("    Tunables live in the TOML config file:");
    println!("    - [fusion] tick_rate, decay_lambda, max_age_secs, tile levels");
    println!("    - [transport] qos, topics, ingest queue size");
    println!("    - [cache] quadkey cache capacity");
}

fn load_config(args: &Args) -> Config {
    match &args.config_path {
        Some(path) => match fs::read_to_string(path) {
            Ok(contents) => match basic_toml::from_str(&contents) {
                Ok(cfg) => {
                    log::info!("Loaded config from {}", path);
                    cfg
                }
                Err(e) => {
                    log::warn!("Failed to parse config {}: {}", path, e);
                    Config::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read config {}: {}", path, e);
                Config::default()
            }
        },
        None => {
            for path in &["edgefuse.toml", "/etc/edgefuse.toml"] {
                if let Ok(contents) = fs::read_to_string(path) {
                    if let Ok(cfg) = basic_toml::from_str(&contents) {
                        log::info!("Loaded config from {}", path);
                        return cfg;
                    }
                }
            }
            Config::default()
        }
    }
}

/// Sector keys must be base-4 digit strings coarser than the remote
/// tile level.
fn validate_tile(tile: &str, remote_tile_level: usize) -> Result<(), String> {
    if tile.is_empty() {
        return Err("sector quadkey is empty".to_string());
    }
    if tile.len() >= remote_tile_level {
        return Err(format!(
            "sector quadkey has {} digits, must be coarser than remote tile level {}",
            tile.len(),
            remote_tile_level
        ));
    }
    if let Some(bad) = tile.chars().find(|c| !('0'..='3').contains(c)) {
        return Err(format!("invalid quadkey digit '{}'", bad));
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} - {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = parse_args();
    let config = load_config(&args);

    let tile = match args.tile.clone().or_else(|| {
        if config.node.tile.is_empty() {
            None
        } else {
            Some(config.node.tile.clone())
        }
    }) {
        Some(tile) => tile,
        None => {
            eprintln!("Missing required --tile argument");
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(msg) = validate_tile(&tile, config.fusion.remote_tile_level) {
        log::error!("Invalid sector tile {:?}: {}", tile, msg);
        std::process::exit(1);
    }

    let broker = args
        .broker
        .clone()
        .unwrap_or_else(|| config.node.broker.clone());

    log::info!("edgefuse starting");
    log::info!("  Sector: {}", tile);
    log::info!("  Broker: {}", broker);
    log::info!(
        "  Levels: grid {} / remote {}",
        config.fusion.grid_tile_level,
        config.fusion.remote_tile_level
    );
    log::info!(
        "  Tick: {:.1} Hz, window {:.1}s, lambda {}",
        config.fusion.tick_rate,
        config.fusion.max_age_secs,
        config.fusion.decay_lambda
    );

    // Setup signal handler
    let running = Arc::new(AtomicBool::new(true));
    setup_signal_handler(Arc::clone(&running));

    if let Err(e) = run(config, tile, broker, running) {
        log::error!("Startup error: {}", e);
        std::process::exit(1);
    }

    log::info!("edgefuse shutdown complete");
}

fn setup_signal_handler(running: Arc<AtomicBool>) {
    thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            let mut signals =
                Signals::new([SIGINT, SIGTERM]).expect("Failed to register signal handlers");

            if let Some(sig) = signals.forever().next() {
                log::info!("Received signal {:?}, initiating shutdown...", sig);
                running.store(false, Ordering::Relaxed);
            }
        })
        .expect("Failed to spawn signal handler thread");
}

// ============================================================================
// Daemon
// ============================================================================

fn run(
    config: Config,
    tile: String,
    broker: String,
    running: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    // 1. Assemble the engine
    let engine_config = EngineConfig {
        sector: tile,
        grid_tile_level: config.fusion.grid_tile_level,
        remote_tile_level: config.fusion.remote_tile_level,
        decay_lambda: config.fusion.decay_lambda,
        max_age: (config.fusion.max_age_secs * NANOS_PER_SEC as f64) as u64,
        max_fusion_workers: config.fusion.max_workers,
        quadkey_cache_capacity: config.cache.quadkey_capacity,
        node_id: config.node.id,
    };
    let engine = Engine::new(engine_config, Arc::new(ProtoSceneCodec::new()));
    log::info!("  Engine initialized");

    // 2. Connect to the broker; unreachable broker is fatal
    let (transport, connection) = MqttTransport::connect(&MqttConfig {
        broker_url: broker,
        client_id: config.transport.client_id.clone(),
        qos: config.transport.qos,
    })?;
    transport.subscribe(&config.transport.topic_in)?;
    log::info!("  Subscribed to {}", config.transport.topic_in);

    // 3. Spawn threads
    let (payload_tx, payload_rx) = bounded::<Vec<u8>>(config.transport.ingest_queue.max(1));
    let mqtt_thread = mqtt::spawn_event_loop(connection, payload_tx, Arc::clone(&running));

    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let ingest_pool = IngestPool::spawn(
        workers,
        payload_rx,
        engine.ingest_context(),
        Arc::clone(&running),
    );

    let tick_thread = TickThread::spawn(
        TickConfig {
            tick_rate: config.fusion.tick_rate,
            topic_prefix: config.transport.topic_out_prefix.clone(),
        },
        engine.reducer(),
        transport.clone(),
        Arc::clone(&engine.counters),
        engine.active_keys.clone(),
        Arc::clone(&running),
    );

    let monitor_thread = monitor::spawn(
        Arc::clone(&engine.counters),
        engine.active_keys.clone(),
        engine.config.max_age,
        Arc::clone(&running),
    );
    let timing_thread =
        TimingService::spawn_reporter(Arc::clone(&engine.timing), Arc::clone(&running));

    log::info!("edgefuse running ({} ingest workers)", workers);

    // 4. Wait for shutdown signal
    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    // 5. Drain: disconnecting ends the event loop, which closes the
    // ingest channel; workers drain what is left and exit.
    log::info!("Shutdown signal received, stopping threads...");
    transport.disconnect();
    mqtt_thread.join().ok();
    ingest_pool.join();
    if let Err(e) = tick_thread.join() {
        log::error!("Tick thread panicked: {:?}", e);
    }
    monitor_thread.join().ok();
    timing_thread.join().ok();

    log::info!("All threads stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_validation() {
        assert!(validate_tile("1202032332303131", 19).is_ok());
        assert!(validate_tile("", 19).is_err());
        assert!(validate_tile("120203233230313101010", 19).is_err());
        assert!(validate_tile("12020gArbagE", 19).is_err());
    }

    #[test]
    fn config_defaults_match_daemon_contract() {
        let config = Config::default();
        assert_eq!(config.fusion.tick_rate, 10.0);
        assert_eq!(config.fusion.grid_tile_level, 24);
        assert_eq!(config.fusion.remote_tile_level, 19);
        assert_eq!(config.transport.topic_in, "/graph_raw_in");
        assert_eq!(config.transport.topic_out_prefix, "/graph_fused_out");
        assert_eq!(config.transport.qos, 1);
    }

    #[test]
    fn config_parses_partial_toml() {
        let config: Config = basic_toml::from_str(
            r#"
            [fusion]
            tick_rate = 20.0
            max_age_secs = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(config.fusion.tick_rate, 20.0);
        assert_eq!(config.fusion.max_age_secs, 1.5);
        // Untouched sections keep their defaults.
        assert_eq!(config.transport.qos, 1);
        assert_eq!(config.cache.quadkey_capacity, 65_536);
    }
}
