//! Wire message types published and received by the device
//!
//! All payloads are JSON with camelCase field names. Timestamps are Unix
//! milliseconds.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current wall-clock time in Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Device status message (retained)
///
/// Published to `devices/{device_id}/status` with the retain flag. The
/// broker replays the `offline` variant as the Last Will.
///
/// # Examples
/// ```
/// use biotrack_device::protocol::{DeviceStatus, DeviceStatusType};
///
/// let status = DeviceStatus {
///     device_id: "biotrack_device_001".to_string(),
///     status: DeviceStatusType::Online,
///     timestamp: 1_700_000_000_000,
///     user_id: None,
///     firmware_version: "1.0.0".to_string(),
///     uptime: 42,
/// };
/// let json = serde_json::to_value(&status).unwrap();
/// assert_eq!(json["status"], "online");
/// assert_eq!(json["deviceId"], "biotrack_device_001");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub status: DeviceStatusType,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub firmware_version: String,
    /// Seconds since the agent started
    pub uptime: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatusType {
    Online,
    Offline,
}

impl DeviceStatusType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatusType::Online => "online",
            DeviceStatusType::Offline => "offline",
        }
    }
}

/// Periodic liveness report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub device_id: String,
    pub timestamp: i64,
    pub uptime: u64,
    pub firmware_version: String,
    pub queue_size: usize,
    pub retry_queue_size: usize,
    /// Human-readable connection status, e.g. "Connected"
    pub connection: String,
    pub pending_alerts: usize,
    pub upload_success_rate: f64,
}

/// Coarse data quality label attached to telemetry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    Good,
    Fair,
    Poor,
}

impl DataQuality {
    /// Invalid readings are always poor; otherwise bucket the 0-100 score
    pub fn assess(valid: bool, quality_score: Option<f64>) -> Self {
        if !valid {
            return DataQuality::Poor;
        }
        match quality_score {
            None => DataQuality::Good,
            Some(score) if score >= 80.0 => DataQuality::Good,
            Some(score) if score >= 50.0 => DataQuality::Fair,
            Some(_) => DataQuality::Poor,
        }
    }
}

/// Single-sensor telemetry message, published to `devices/{id}/telemetry/{sensorType}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub device_id: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: i64,
    pub user_id: Option<String>,
    pub firmware_version: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub quality: DataQuality,
    pub calibrated: bool,
}

/// Alert categories raised by threshold rules
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    HighHeartRate,
    LowHeartRate,
    LowSpo2,
    HighTemperature,
    LowTemperature,
    UnstableWeight,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::HighHeartRate => "HIGH_HEART_RATE",
            AlertType::LowHeartRate => "LOW_HEART_RATE",
            AlertType::LowSpo2 => "LOW_SPO2",
            AlertType::HighTemperature => "HIGH_TEMPERATURE",
            AlertType::LowTemperature => "LOW_TEMPERATURE",
            AlertType::UnstableWeight => "UNSTABLE_WEIGHT",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Alert message, published to `devices/{id}/alerts`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage {
    pub device_id: String,
    pub alert_type: AlertType,
    pub value: f64,
    pub severity: AlertSeverity,
    /// Human-readable description (no sensitive data)
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Response to an inbound command, published to `devices/{id}/responses/{command}`
///
/// Handler results are flattened into the top level of the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub command: String,
    pub request_id: String,
    pub status: ResponseStatus,
    pub device_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub result: Map<String, Value>,
}

/// Top-level response keys a handler result may not overwrite
pub const RESERVED_RESPONSE_FIELDS: [&str; 6] =
    ["command", "requestId", "status", "deviceId", "timestamp", "error"];

impl CommandResponse {
    /// Merge handler fields into the top level of the response
    ///
    /// Fields named like a reserved key are kept under a nested `result`
    /// object instead, so the envelope stays intact. Returns the moved keys.
    pub fn merge_result(&mut self, fields: Map<String, Value>) -> Vec<String> {
        let mut nested = Map::new();
        for (key, value) in fields {
            if RESERVED_RESPONSE_FIELDS.contains(&key.as_str()) {
                nested.insert(key, value);
            } else {
                self.result.insert(key, value);
            }
        }

        let moved: Vec<String> = nested.keys().cloned().collect();
        if !nested.is_empty() {
            self.result.insert("result".to_string(), Value::Object(nested));
        }
        moved
    }
}

/// Message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}
