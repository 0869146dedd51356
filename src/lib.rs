//! BioTrack device agent
//!
//! Device-side runtime of the BioTrack health monitor: samples vital signs,
//! analyses them on the device, keeps a bounded local history with threshold
//! alerts, and talks to the cloud over a TLS MQTT session.
//!
//! # Overview
//!
//! - [`vitals`] - blood pressure, body composition and glucose analysis
//! - [`device`] - sensor sources, the device shadow, command dispatch and the agent loop
//! - [`storage`] - reading history, alert rules and on-disk persistence
//! - [`transport`] - the MQTT client and the outbound/retry queues
//! - [`ota`] - firmware update checks and staging
//! - [`observability`] - logging, metrics and the health endpoint
//!
//! # Quick Start
//!
//! ```rust
//! use biotrack_device::protocol::TopicBuilder;
//! use biotrack_device::vitals::readings::HeartRateData;
//! use biotrack_device::vitals::SensorReading;
//!
//! let mut reading = SensorReading::new("biotrack_device_001", 1_700_000_000_000);
//! reading.heart_rate = Some(HeartRateData::measured(72.0, 98.0));
//! assert!(reading.is_valid());
//!
//! let topic = TopicBuilder::telemetry("biotrack_device_001", "heart_rate");
//! assert_eq!(topic, "devices/biotrack_device_001/telemetry/heart_rate");
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod observability;
pub mod ota;
pub mod protocol;
pub mod storage;
pub mod testing;
pub mod transport;
pub mod vitals;

pub use config::*;
pub use device::{DeviceAgent, SimulatedSensors};
pub use error::{DeviceError, DeviceResult};
pub use ota::{OtaError, OtaManager, OtaState, UpdateInfo};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
