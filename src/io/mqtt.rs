//! MQTT transport.
//!
//! The engine only needs "publish(topic, bytes)" outbound and a stream
//! of raw payloads inbound; everything broker-specific stays here. The
//! event-loop thread forwards each incoming publish into the bounded
//! ingest channel with a blocking send, which is the backpressure
//! mechanism: under overload the broker connection stalls and the
//! freshness check at ingest sheds the backlog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use thiserror::Error;

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid broker url '{0}'")]
    BrokerUrl(String),

    #[error("invalid QoS level {0}")]
    Qos(u8),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("publish failed: {0}")]
    Publish(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker endpoint, `tcp://host:port`.
    pub broker_url: String,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Delivery guarantee for subscriptions and publications (0..=2).
    pub qos: u8,
}

#[derive(Clone)]
pub struct MqttTransport {
    client: Client,
    qos: QoS,
}

impl MqttTransport {
    /// Connect to the broker. Blocks until the broker acknowledges the
    /// session; a refused or unreachable broker is a startup failure.
    pub fn connect(cfg: &MqttConfig) -> Result<(Self, Connection)> {
        let (host, port) = parse_broker_url(&cfg.broker_url)?;
        let qos = parse_qos(cfg.qos)?;

        let mut options = MqttOptions::new(cfg.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(5));

        let (client, mut connection) = Client::new(options, 64);

        {
            let mut events = connection.iter();
            loop {
                match events.next() {
                    Some(Ok(Event::Incoming(Packet::ConnAck(_)))) => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(TransportError::Connect(e.to_string())),
                    None => {
                        return Err(TransportError::Connect(
                            "connection closed before CONNACK".into(),
                        ))
                    }
                }
            }
        }

        log::info!("Connected to broker {}", cfg.broker_url);
        Ok((Self { client, qos }, connection))
    }

    pub fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, self.qos)
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, self.qos, false, payload)
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    pub fn disconnect(&self) {
        self.client.disconnect().ok();
    }
}

/// Spawn the broker event loop. Incoming publishes are forwarded into
/// `ingest_tx`; the send blocks when the ingest queue is full.
pub fn spawn_event_loop(
    mut connection: Connection,
    ingest_tx: Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("mqtt".into())
        .spawn(move || {
            for event in connection.iter() {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if ingest_tx.send(publish.payload.to_vec()).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("MQTT connection error: {}", e);
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        thread::sleep(Duration::from_millis(500));
                    }
                }
            }
            log::debug!("MQTT event loop exiting");
        })
        .expect("Failed to spawn MQTT thread")
}

fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::BrokerUrl(url.to_owned()))?;
            (host, port)
        }
        None => (rest, 1883),
    };

    if host.is_empty() {
        return Err(TransportError::BrokerUrl(url.to_owned()));
    }
    Ok((host.to_owned(), port))
}

fn parse_qos(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::Qos(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_variants_parse() {
        assert_eq!(
            parse_broker_url("tcp://localhost:1883").unwrap(),
            ("localhost".to_owned(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt://broker.lan:2000").unwrap(),
            ("broker.lan".to_owned(), 2000)
        );
        assert_eq!(
            parse_broker_url("localhost").unwrap(),
            ("localhost".to_owned(), 1883)
        );
        assert!(parse_broker_url("tcp://:1883").is_err());
        assert!(parse_broker_url("tcp://host:notaport").is_err());
    }

    #[test]
    fn qos_levels_map() {
        assert_eq!(parse_qos(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(parse_qos(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(parse_qos(2).unwrap(), QoS::ExactlyOnce);
        assert!(parse_qos(3).is_err());
    }
}
