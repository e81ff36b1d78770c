//! I/O boundary: wire codec and broker transport. Both are replaceable;
//! the engine sees bytes in and `(topic, bytes)` out.

pub mod codec;
pub mod mqtt;

pub use codec::{CodecError, ProtoSceneCodec, SceneCodec};
pub use mqtt::{MqttConfig, MqttTransport, TransportError};

/// Outbound half of the transport, as the tick loop sees it.
pub trait Publisher: Send + 'static {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

impl Publisher for MqttTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        MqttTransport::publish(self, topic, payload)
    }
}
