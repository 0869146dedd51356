//! Device configuration loaded from TOML
//!
//! Credentials are never stored in the file. `username_env`/`password_env`
//! name environment variables that are read when the MQTT session is opened.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main device configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub sensors: SensorSection,
    #[serde(default)]
    pub alerts: AlertThresholds,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub user: UserProfile,
    /// Firmware update server (optional)
    pub ota: Option<OtaSection>,
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Human-readable device name
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,
    /// User the device is paired with, if already known
    pub user_id: Option<String>,
}

impl DeviceSection {
    /// Section for `id` with the default name and firmware version
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: default_device_name(),
            firmware_version: default_firmware_version(),
            user_id: None,
        }
    }
}

fn default_device_name() -> String {
    "BioTrack Health Monitor".to_string()
}

fn default_firmware_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Root CA used to verify the broker (PEM)
    pub ca_cert_path: Option<PathBuf>,
    /// Device certificate for mutual TLS (PEM)
    pub client_cert_path: Option<PathBuf>,
    /// Device private key for mutual TLS (PEM)
    pub client_key_path: Option<PathBuf>,
    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Reconnection attempts before the session is declared permanently lost
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_message_queue_size")]
    pub message_queue_size: usize,
    #[serde(default = "default_retry_queue_size")]
    pub retry_queue_size: usize,
    /// Publish attempts per message before it is discarded
    #[serde(default = "default_max_publish_attempts")]
    pub max_publish_attempts: u32,
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_keep_alive() -> u64 {
    60
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_message_queue_size() -> usize {
    20
}

fn default_retry_queue_size() -> usize {
    10
}

fn default_max_publish_attempts() -> u32 {
    3
}

impl MqttSection {
    /// Minimal section for a broker URL with every other field defaulted
    pub fn with_broker(broker_url: &str) -> Self {
        Self {
            broker_url: broker_url.to_string(),
            username_env: None,
            password_env: None,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            keep_alive_secs: default_keep_alive(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            message_queue_size: default_message_queue_size(),
            retry_queue_size: default_retry_queue_size(),
            max_publish_attempts: default_max_publish_attempts(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.broker_url must not be empty".to_string(),
            ));
        }
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.client_cert_path and mqtt.client_key_path must be set together".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.max_reconnect_attempts must be greater than 0".to_string(),
            ));
        }
        if self.message_queue_size == 0 || self.retry_queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt queue sizes must be greater than 0".to_string(),
            ));
        }
        if self.max_publish_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.max_publish_attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sensor sampling configuration, intervals in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorSection {
    #[serde(default = "default_sensor_source")]
    pub source: String,
    #[serde(default = "default_heart_rate_interval")]
    pub heart_rate_interval_ms: u64,
    #[serde(default = "default_temperature_interval")]
    pub temperature_interval_ms: u64,
    #[serde(default = "default_weight_interval")]
    pub weight_interval_ms: u64,
    #[serde(default = "default_bioimpedance_interval")]
    pub bioimpedance_interval_ms: u64,
    #[serde(default = "default_ecg_interval")]
    pub ecg_interval_ms: u64,
    #[serde(default = "default_glucose_interval")]
    pub glucose_interval_ms: u64,
    /// Batch upload interval
    #[serde(default = "default_upload_interval")]
    pub upload_interval_ms: u64,
}

fn default_sensor_source() -> String {
    "simulated".to_string()
}

fn default_heart_rate_interval() -> u64 {
    2000
}

fn default_temperature_interval() -> u64 {
    5000
}

fn default_weight_interval() -> u64 {
    1000
}

fn default_bioimpedance_interval() -> u64 {
    10000
}

fn default_ecg_interval() -> u64 {
    1000
}

fn default_glucose_interval() -> u64 {
    30000
}

fn default_upload_interval() -> u64 {
    5000
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            source: default_sensor_source(),
            heart_rate_interval_ms: default_heart_rate_interval(),
            temperature_interval_ms: default_temperature_interval(),
            weight_interval_ms: default_weight_interval(),
            bioimpedance_interval_ms: default_bioimpedance_interval(),
            ecg_interval_ms: default_ecg_interval(),
            glucose_interval_ms: default_glucose_interval(),
            upload_interval_ms: default_upload_interval(),
        }
    }
}

impl SensorSection {
    /// Base sampling tick: the fastest configured sensor interval
    pub fn sample_interval_ms(&self) -> u64 {
        [
            self.heart_rate_interval_ms,
            self.temperature_interval_ms,
            self.weight_interval_ms,
            self.bioimpedance_interval_ms,
            self.ecg_interval_ms,
            self.glucose_interval_ms,
        ]
        .into_iter()
        .min()
        .unwrap_or(1000)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source != "simulated" {
            return Err(ConfigError::InvalidConfig(format!(
                "Unsupported sensor source '{}'",
                self.source
            )));
        }
        let intervals = [
            ("heart_rate_interval_ms", self.heart_rate_interval_ms),
            ("temperature_interval_ms", self.temperature_interval_ms),
            ("weight_interval_ms", self.weight_interval_ms),
            ("bioimpedance_interval_ms", self.bioimpedance_interval_ms),
            ("ecg_interval_ms", self.ecg_interval_ms),
            ("glucose_interval_ms", self.glucose_interval_ms),
            ("upload_interval_ms", self.upload_interval_ms),
        ];
        for (name, value) in intervals {
            if value < 100 {
                return Err(ConfigError::InvalidConfig(format!(
                    "sensors.{name} must be at least 100ms, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertThresholds {
    #[serde(default = "default_heart_rate_high")]
    pub heart_rate_high: f64,
    #[serde(default = "default_heart_rate_low")]
    pub heart_rate_low: f64,
    #[serde(default = "default_spo2_low")]
    pub spo2_low: f64,
    #[serde(default = "default_spo2_critical")]
    pub spo2_critical: f64,
    #[serde(default = "default_temperature_high")]
    pub temperature_high: f64,
    #[serde(default = "default_temperature_low")]
    pub temperature_low: f64,
}

fn default_heart_rate_high() -> f64 {
    180.0
}

fn default_heart_rate_low() -> f64 {
    40.0
}

fn default_spo2_low() -> f64 {
    95.0
}

fn default_spo2_critical() -> f64 {
    90.0
}

fn default_temperature_high() -> f64 {
    39.0
}

fn default_temperature_low() -> f64 {
    35.0
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            heart_rate_high: default_heart_rate_high(),
            heart_rate_low: default_heart_rate_low(),
            spo2_low: default_spo2_low(),
            spo2_critical: default_spo2_critical(),
            temperature_high: default_temperature_high(),
            temperature_low: default_temperature_low(),
        }
    }
}

impl AlertThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heart_rate_low >= self.heart_rate_high {
            return Err(ConfigError::InvalidConfig(
                "alerts.heart_rate_low must be below alerts.heart_rate_high".to_string(),
            ));
        }
        if self.spo2_critical > self.spo2_low {
            return Err(ConfigError::InvalidConfig(
                "alerts.spo2_critical must not exceed alerts.spo2_low".to_string(),
            ));
        }
        if self.temperature_low >= self.temperature_high {
            return Err(ConfigError::InvalidConfig(
                "alerts.temperature_low must be below alerts.temperature_high".to_string(),
            ));
        }
        Ok(())
    }
}

/// Local persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Readings and alerts kept in memory
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_buffer_size() -> usize {
    10
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_buffer_size: default_max_buffer_size(),
        }
    }
}

/// Biological sex used by the body composition and blood pressure models
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    pub fn is_male(self) -> bool {
        matches!(self, Sex::Male)
    }
}

/// Personal parameters of the paired user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    #[serde(default = "default_age")]
    pub age: u32,
    #[serde(default = "default_height")]
    pub height_cm: f64,
    #[serde(default = "default_weight")]
    pub weight_kg: f64,
    #[serde(default = "default_sex")]
    pub sex: Sex,
    #[serde(default)]
    pub athlete: bool,
}

fn default_age() -> u32 {
    30
}

fn default_height() -> f64 {
    170.0
}

fn default_weight() -> f64 {
    70.0
}

fn default_sex() -> Sex {
    Sex::Male
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            age: default_age(),
            height_cm: default_height(),
            weight_kg: default_weight(),
            sex: default_sex(),
            athlete: false,
        }
    }
}

impl UserProfile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=120).contains(&self.age) {
            return Err(ConfigError::InvalidConfig(format!(
                "user.age must be between 1 and 120, got {}",
                self.age
            )));
        }
        if !(50.0..=250.0).contains(&self.height_cm) {
            return Err(ConfigError::InvalidConfig(format!(
                "user.height_cm must be between 50 and 250, got {}",
                self.height_cm
            )));
        }
        if !(2.0..=500.0).contains(&self.weight_kg) {
            return Err(ConfigError::InvalidConfig(format!(
                "user.weight_kg must be between 2 and 500, got {}",
                self.weight_kg
            )));
        }
        Ok(())
    }
}

/// Firmware update server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtaSection {
    pub server_url: String,
    #[serde(default = "default_ota_check_interval")]
    pub check_interval_secs: u64,
    /// Install updates flagged as required without operator action
    #[serde(default = "default_auto_install_required")]
    pub auto_install_required: bool,
}

fn default_ota_check_interval() -> u64 {
    24 * 60 * 60
}

fn default_auto_install_required() -> bool {
    true
}

impl OtaSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.server_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "ota.server_url '{}' is not a valid URL: {e}",
                self.server_url
            ))
        })?;
        if self.check_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "ota.check_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load configuration from a TOML file and validate every section
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;
        self.mqtt.validate()?;
        self.sensors.validate()?;
        self.alerts.validate()?;
        self.user.validate()?;
        if self.storage.max_buffer_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "storage.max_buffer_size must be greater than 0".to_string(),
            ));
        }
        if let Some(ref ota) = self.ota {
            ota.validate()?;
        }
        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Require an environment variable, for deployments that mandate credentials
    pub fn require_env_var(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "biotrack_device_001"
firmware_version = "1.0.0"

[mqtt]
broker_url = "mqtt://localhost:1883"

[user]
age = 35
height_cm = 175.0
weight_kg = 72.0
sex = "male"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate device ID format
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    crate::protocol::validate_device_id(device_id)
        .map_err(|e| ConfigError::InvalidDeviceId(format!("'{device_id}': {e}")))
}
