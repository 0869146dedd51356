//! Device shadow: reported state and delta handling

use crate::vitals::SensorReading;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const MIN_SAMPLE_RATE_MS: u64 = 100;
pub const MAX_SAMPLE_RATE_MS: u64 = 60_000;

/// Latest value per sensor, mirrored in the shadow
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bioimpedance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spo2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceShadow {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub firmware_version: String,
    /// Sampling tick in milliseconds
    pub sample_rate: u64,
    pub sensors: SensorSnapshot,
}

/// A change applied from a shadow delta
#[derive(Debug, Clone, PartialEq)]
pub enum ShadowChange {
    UserId(String),
    SampleRate(u64),
    /// Field present in the delta but refused
    Rejected { field: String, reason: String },
}

impl DeviceShadow {
    pub fn new(firmware_version: impl Into<String>, sample_rate: u64) -> Self {
        Self {
            status: "online".to_string(),
            user_id: None,
            firmware_version: firmware_version.into(),
            sample_rate,
            sensors: SensorSnapshot::default(),
        }
    }

    pub fn reported_document(&self) -> Value {
        json!({ "state": { "reported": self } })
    }

    /// Copy valid sensor values from a reading
    pub fn update_from_reading(&mut self, reading: &SensorReading) {
        if let Some(t) = reading.temperature.as_ref().filter(|t| t.valid) {
            self.sensors.temperature = Some(t.value);
        }
        if let Some(w) = reading.weight.as_ref().filter(|w| w.valid) {
            self.sensors.weight = Some(w.value);
        }
        if let Some(b) = reading.bioimpedance.as_ref().filter(|b| b.valid) {
            self.sensors.bioimpedance = Some(b.value);
        }
        if let Some(hr) = reading.heart_rate.as_ref().filter(|hr| hr.valid) {
            self.sensors.heart_rate = Some(hr.value);
            self.sensors.spo2 = Some(hr.spo2);
        }
    }

    /// Apply a `$aws/things/{id}/shadow/update/delta` document
    ///
    /// Accepts both the delta form `{"state": {...}}` and a bare state object.
    pub fn apply_delta(&mut self, delta: &Value) -> Vec<ShadowChange> {
        let state = delta.get("state").unwrap_or(delta);
        let mut changes = Vec::new();

        if let Some(user_id) = state.get("userId") {
            match user_id.as_str().filter(|s| !s.is_empty()) {
                Some(id) => {
                    self.user_id = Some(id.to_string());
                    changes.push(ShadowChange::UserId(id.to_string()));
                }
                None => changes.push(ShadowChange::Rejected {
                    field: "userId".to_string(),
                    reason: "must be a non-empty string".to_string(),
                }),
            }
        }

        if let Some(rate) = state.get("sampleRate") {
            match rate.as_u64() {
                Some(ms) if (MIN_SAMPLE_RATE_MS..=MAX_SAMPLE_RATE_MS).contains(&ms) => {
                    self.sample_rate = ms;
                    changes.push(ShadowChange::SampleRate(ms));
                }
                _ => changes.push(ShadowChange::Rejected {
                    field: "sampleRate".to_string(),
                    reason: format!(
                        "must be between {MIN_SAMPLE_RATE_MS} and {MAX_SAMPLE_RATE_MS} ms"
                    ),
                }),
            }
        }

        changes
    }
}
