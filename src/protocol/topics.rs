//! Topic layout and device ID validation
//!
//! Device topics live under `devices/{device_id}/...`; shadow topics use the
//! `$aws/things/{device_id}/shadow/...` namespace. Neither form carries a
//! leading slash, so canonicalization strips it.

use thiserror::Error;

/// Topic prefix for every device-owned topic
pub const DEVICE_TOPIC_PREFIX: &str = "devices";

/// Normalize a topic: collapse repeated slashes, drop leading and trailing ones
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for device identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}

/// Topic builder for device topics
pub struct TopicBuilder;

impl TopicBuilder {
    fn device_topic(device_id: &str, suffix: &str) -> String {
        canonicalize_topic(&format!("{DEVICE_TOPIC_PREFIX}/{device_id}/{suffix}"))
    }

    /// `devices/{id}/telemetry/{sensor_type}`
    pub fn telemetry(device_id: &str, sensor_type: &str) -> String {
        Self::device_topic(device_id, &format!("telemetry/{sensor_type}"))
    }

    /// `devices/{id}/alerts`
    pub fn alerts(device_id: &str) -> String {
        Self::device_topic(device_id, "alerts")
    }

    /// `devices/{id}/events` (batched sensor data)
    pub fn events(device_id: &str) -> String {
        Self::device_topic(device_id, "events")
    }

    /// `devices/{id}/heartbeat`
    pub fn heartbeat(device_id: &str) -> String {
        Self::device_topic(device_id, "heartbeat")
    }

    /// `devices/{id}/status` (retained)
    pub fn status(device_id: &str) -> String {
        Self::device_topic(device_id, "status")
    }

    /// `devices/{id}/commands/+`
    pub fn commands_filter(device_id: &str) -> String {
        Self::device_topic(device_id, "commands/+")
    }

    /// `devices/{id}/responses/{command}`
    pub fn response(device_id: &str, command: &str) -> String {
        Self::device_topic(device_id, &format!("responses/{command}"))
    }

    /// `$aws/things/{id}/shadow/update`
    pub fn shadow_update(device_id: &str) -> String {
        canonicalize_topic(&format!("$aws/things/{device_id}/shadow/update"))
    }

    /// `$aws/things/{id}/shadow/update/delta`
    pub fn shadow_delta(device_id: &str) -> String {
        canonicalize_topic(&format!("$aws/things/{device_id}/shadow/update/delta"))
    }

    /// `$aws/things/{id}/shadow/update/accepted`
    pub fn shadow_accepted(device_id: &str) -> String {
        canonicalize_topic(&format!("$aws/things/{device_id}/shadow/update/accepted"))
    }
}
