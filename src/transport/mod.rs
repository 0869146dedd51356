//! Transport layer for device telemetry and commands
//!
//! [`Transport`] is the seam between the device runtime and the broker. The
//! production implementation is [`mqtt::MqttClient`]; tests use the in-memory
//! mock from `crate::testing`.

use crate::protocol::InboundMessage;
use crate::transport::mqtt::ConnectionState;

pub mod mqtt;
pub mod queue;

pub use queue::{
    MessageQueue, OutboundMessage, OutboundPipeline, Priority, QueueError, RetryOutcome,
    RetryQueue,
};

/// Transport trait for device communication
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker; returns once the session is acknowledged
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the broker
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Publish a payload with QoS 1
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), Self::Error>;

    /// Subscribe to a topic filter; the subscription survives reconnects
    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    fn is_connected(&self) -> bool;

    /// Current connection state, None before the first connect
    fn connection_state(&self) -> Option<ConnectionState>;

    fn is_permanently_disconnected(&self) -> bool;

    /// Channel that receives every accepted inbound publish
    fn set_inbound_sender(&self, sender: tokio::sync::mpsc::Sender<InboundMessage>);
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
