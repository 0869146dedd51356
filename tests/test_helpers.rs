//! Test helpers and utilities for integration tests

use biotrack_device::config::DeviceConfig;
use biotrack_device::device::{DeviceAgent, SimulatedSensors};
use biotrack_device::testing::MockTransport;
use std::path::Path;

pub const DEVICE_ID: &str = "biotrack_device_001";

/// Configuration for integration tests, storing data under `data_dir`
#[allow(dead_code)]
pub fn test_config(data_dir: &Path) -> DeviceConfig {
    let toml_content = format!(
        r#"
[device]
id = "{DEVICE_ID}"
firmware_version = "1.0.0"

[mqtt]
broker_url = "mqtt://localhost:1883"
heartbeat_interval_secs = 60
message_queue_size = 64
retry_queue_size = 16
max_publish_attempts = 3

[storage]
data_dir = "{}"
max_buffer_size = 10

[user]
age = 30
height_cm = 170.0
weight_kg = 70.0
sex = "male"
"#,
        data_dir.display().to_string().replace('\\', "/")
    );
    DeviceConfig::from_toml_str(&toml_content).unwrap()
}

/// A started agent on a mock transport, plus a handle onto that transport
#[allow(dead_code)]
pub async fn started_agent(
    config: DeviceConfig,
) -> (DeviceAgent<MockTransport, SimulatedSensors>, MockTransport) {
    let transport = MockTransport::new();
    let handle = transport.clone();
    let mut agent = DeviceAgent::new(config, transport, SimulatedSensors::default()).unwrap();
    agent.start().await.unwrap();
    (agent, handle)
}
