//! MQTT transport for the BioTrack device
//!
//! Pure logic and I/O are kept apart:
//!
//! - [`connection`] - connection states, backoff curve, `MqttOptions` (TLS, Last Will)
//! - [`message_handler`] - event routing and inbound topic classification
//! - [`health_monitor`] - reconnection decisions and link health
//! - [`client`] - the rumqttc client and its connection supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use biotrack_device::config::{DeviceSection, MqttSection};
//! use biotrack_device::transport::mqtt::MqttClient;
//! use biotrack_device::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let device = DeviceSection::new("biotrack_device_001");
//! let config = MqttSection::with_broker("mqtts://iot.example.com:8883");
//! let mut client = MqttClient::new(&device, config).await?;
//! client.connect().await?;
//! client.subscribe("devices/biotrack_device_001/commands/+").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{
    ConnectionEvent, ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision,
};
pub use message_handler::{EventRoute, InboundKind, MessageHandler};
