//! On-device reading history, alert rules and persistence
//!
//! Readings and alerts are held in bounded rings. Every accepted reading is
//! appended to `sensor_data.jsonl`; the alert ring is rewritten to
//! `alerts.json` whenever it changes.

use crate::config::{AlertThresholds, StorageSection};
use crate::error::{sanitize_error_message, DeviceError, DeviceResult};
use crate::observability::metrics::metrics;
use crate::protocol::{now_millis, AlertMessage, AlertSeverity, AlertType};
use crate::vitals::signal::RingBuffer;
use crate::vitals::SensorReading;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SENSOR_DATA_FILE: &str = "sensor_data.jsonl";
pub const ALERTS_FILE: &str = "alerts.json";
pub const DEVICE_STATE_FILE: &str = "device_state.json";
pub const FAILED_MESSAGES_FILE: &str = "failed_messages.json";

/// Readings included in one upload batch
pub const UPLOAD_BATCH_SIZE: usize = 5;

/// Alert raised by a threshold rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthAlert {
    pub id: String,
    pub alert_type: AlertType,
    pub message: String,
    pub severity: AlertSeverity,
    pub value: f64,
    pub timestamp: i64,
    #[serde(default)]
    pub acknowledged: bool,
}

impl HealthAlert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        value: f64,
        message: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            alert_type,
            message: message.into(),
            severity,
            value,
            timestamp,
            acknowledged: false,
        }
    }

    /// Wire form published to the alerts topic
    pub fn to_message(&self, device_id: &str) -> AlertMessage {
        AlertMessage {
            device_id: device_id.to_string(),
            alert_type: self.alert_type,
            value: self.value,
            severity: self.severity,
            message: sanitize_error_message(&self.message),
            timestamp: self.timestamp,
        }
    }
}

/// Apply the threshold rules to one reading
///
/// Only valid sections are considered. Heart rate and temperature each raise
/// at most one alert (high is checked before low).
pub fn evaluate_alert_rules(
    reading: &SensorReading,
    thresholds: &AlertThresholds,
) -> Vec<HealthAlert> {
    let ts = reading.timestamp;
    let mut alerts = Vec::new();

    if let Some(hr) = reading.heart_rate.as_ref().filter(|hr| hr.valid) {
        if hr.value > thresholds.heart_rate_high {
            alerts.push(HealthAlert::new(
                AlertType::HighHeartRate,
                AlertSeverity::High,
                hr.value,
                format!("High heart rate detected: {:.1} BPM", hr.value),
                ts,
            ));
        } else if hr.value < thresholds.heart_rate_low {
            alerts.push(HealthAlert::new(
                AlertType::LowHeartRate,
                AlertSeverity::High,
                hr.value,
                format!("Low heart rate detected: {:.1} BPM", hr.value),
                ts,
            ));
        }

        if hr.spo2 < thresholds.spo2_low {
            let severity = if hr.spo2 < thresholds.spo2_critical {
                AlertSeverity::Critical
            } else {
                AlertSeverity::High
            };
            alerts.push(HealthAlert::new(
                AlertType::LowSpo2,
                severity,
                hr.spo2,
                format!("Low blood oxygen detected: {:.1}%", hr.spo2),
                ts,
            ));
        }
    }

    if let Some(t) = reading.temperature.as_ref().filter(|t| t.valid) {
        if t.value > thresholds.temperature_high {
            alerts.push(HealthAlert::new(
                AlertType::HighTemperature,
                AlertSeverity::Medium,
                t.value,
                format!("High body temperature: {:.1}°C", t.value),
                ts,
            ));
        } else if t.value < thresholds.temperature_low {
            alerts.push(HealthAlert::new(
                AlertType::LowTemperature,
                AlertSeverity::Medium,
                t.value,
                format!("Low body temperature: {:.1}°C", t.value),
                ts,
            ));
        }
    }

    if let Some(w) = reading.weight.as_ref().filter(|w| w.valid && !w.stable) {
        alerts.push(HealthAlert::new(
            AlertType::UnstableWeight,
            AlertSeverity::Low,
            w.value,
            "Weight measurement unstable, please stand still",
            ts,
        ));
    }

    alerts
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatistics {
    pub total_readings: u64,
    pub rejected_readings: u64,
    pub buffered_readings: usize,
    pub total_alerts: u64,
    pub unacknowledged_alerts: usize,
    pub upload_attempts: u64,
    pub successful_uploads: u64,
    pub upload_success_rate: f64,
}

#[derive(Serialize, Deserialize)]
struct AlertsFile {
    alerts: Vec<HealthAlert>,
}

pub struct DataManager {
    device_id: String,
    data_dir: PathBuf,
    thresholds: AlertThresholds,
    readings: RingBuffer<SensorReading>,
    alerts: RingBuffer<HealthAlert>,
    total_readings: u64,
    rejected_readings: u64,
    total_alerts: u64,
    upload_attempts: u64,
    successful_uploads: u64,
}

impl DataManager {
    /// Create the manager and its data directory
    pub fn new(
        device_id: impl Into<String>,
        storage: &StorageSection,
        thresholds: AlertThresholds,
    ) -> DeviceResult<Self> {
        fs::create_dir_all(&storage.data_dir).map_err(|e| {
            DeviceError::storage(format!(
                "Failed to create data directory {}: {e}",
                storage.data_dir.display()
            ))
        })?;

        Ok(Self {
            device_id: device_id.into(),
            data_dir: storage.data_dir.clone(),
            thresholds,
            readings: RingBuffer::new(storage.max_buffer_size),
            alerts: RingBuffer::new(storage.max_buffer_size),
            total_readings: 0,
            rejected_readings: 0,
            total_alerts: 0,
            upload_attempts: 0,
            successful_uploads: 0,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }

    /// Buffer and persist a reading; returns the alerts it raised
    pub fn add_reading(&mut self, reading: SensorReading) -> DeviceResult<Vec<HealthAlert>> {
        if !reading.is_valid() {
            self.rejected_readings += 1;
            metrics().sensor_reading_rejected();
            return Err(DeviceError::invalid_input(
                "Reading contains no valid sensor data",
            ));
        }

        if let Err(e) = self.append_reading(&reading) {
            warn!(error = %e, "Failed to append reading to sensor data log");
        }

        let new_alerts = evaluate_alert_rules(&reading, &self.thresholds);
        self.readings.push(reading);
        self.total_readings += 1;

        if !new_alerts.is_empty() {
            for alert in &new_alerts {
                info!(
                    device_id = %self.device_id,
                    alert_type = alert.alert_type.as_str(),
                    value = alert.value,
                    "Health alert raised"
                );
                metrics().alert_raised();
                self.alerts.push(alert.clone());
            }
            self.total_alerts += new_alerts.len() as u64;
            self.save_alerts()?;
        }

        Ok(new_alerts)
    }

    fn append_reading(&self, reading: &SensorReading) -> DeviceResult<()> {
        let line = serde_json::to_string(reading)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(SENSOR_DATA_FILE))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn save_alerts(&self) -> DeviceResult<()> {
        let document = AlertsFile {
            alerts: self.alerts.iter().cloned().collect(),
        };
        let path = self.path_for(ALERTS_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&document)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Restore persisted alerts at startup; returns how many were loaded
    pub fn load_alerts(&mut self) -> DeviceResult<usize> {
        let path = self.path_for(ALERTS_FILE);
        if !path.exists() {
            return Ok(0);
        }

        let content = fs::read_to_string(&path)?;
        let document: AlertsFile = serde_json::from_str(&content).map_err(|e| {
            DeviceError::storage(format!("Corrupt alerts file {}: {e}", path.display()))
        })?;

        let count = document.alerts.len();
        self.alerts.clear();
        for alert in document.alerts {
            self.alerts.push(alert);
        }
        debug!(count, "Loaded persisted alerts");
        Ok(count.min(self.alerts.capacity()))
    }

    /// Latest readings (newest first) as an upload batch
    pub fn get_pending_data_json(&self) -> Value {
        let readings: Vec<&SensorReading> =
            self.readings.iter().rev().take(UPLOAD_BATCH_SIZE).collect();
        json!({
            "deviceId": self.device_id,
            "batchTimestamp": now_millis(),
            "count": readings.len(),
            "readings": readings,
        })
    }

    pub fn latest_reading(&self) -> Option<&SensorReading> {
        self.readings.latest()
    }

    pub fn buffered_readings(&self) -> usize {
        self.readings.len()
    }

    /// Alerts, newest first
    pub fn recent_alerts(&self) -> Vec<&HealthAlert> {
        self.alerts.iter().rev().collect()
    }

    pub fn acknowledge_alert(&mut self, id: &str) -> bool {
        let Some(alert) = self.alerts.iter_mut().find(|a| a.id == id) else {
            return false;
        };
        alert.acknowledged = true;

        if let Err(e) = self.save_alerts() {
            warn!(error = %e, "Failed to persist acknowledged alert");
        }
        true
    }

    pub fn unacknowledged_alert_count(&self) -> usize {
        self.alerts.iter().filter(|a| !a.acknowledged).count()
    }

    pub fn record_upload(&mut self, success: bool) {
        self.upload_attempts += 1;
        if success {
            self.successful_uploads += 1;
        }
    }

    /// Percentage of successful uploads, 100 before the first attempt
    pub fn upload_success_rate(&self) -> f64 {
        if self.upload_attempts == 0 {
            return 100.0;
        }
        self.successful_uploads as f64 / self.upload_attempts as f64 * 100.0
    }

    pub fn statistics(&self) -> StorageStatistics {
        StorageStatistics {
            total_readings: self.total_readings,
            rejected_readings: self.rejected_readings,
            buffered_readings: self.readings.len(),
            total_alerts: self.total_alerts,
            unacknowledged_alerts: self.unacknowledged_alert_count(),
            upload_attempts: self.upload_attempts,
            successful_uploads: self.successful_uploads,
            upload_success_rate: self.upload_success_rate(),
        }
    }

    /// Drop buffered readings and alerts and remove the alert file
    pub fn clear(&mut self) -> DeviceResult<()> {
        self.readings.clear();
        self.alerts.clear();
        let path = self.path_for(ALERTS_FILE);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
