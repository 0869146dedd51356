//! Error types for the BioTrack device agent
//!
//! `DeviceError` is the crate-wide error. Anything that leaves the device
//! (command responses, alert messages) goes through [`sanitize_error_message`]
//! first so credentials and key material never end up on the broker.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for device agent operations
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Sensor error: {message}")]
    Sensor { message: String },

    #[error("Analysis error: {message}")]
    Analysis { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("OTA error: {message}")]
    Ota { message: String },

    #[error("Command failed: {message}")]
    Command { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeviceError {
    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create sensor error
    pub fn sensor<S: Into<String>>(message: S) -> Self {
        Self::Sensor {
            message: message.into(),
        }
    }

    /// Create analysis error
    pub fn analysis<S: Into<String>>(message: S) -> Self {
        Self::Analysis {
            message: message.into(),
        }
    }

    /// Create storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create OTA error
    pub fn ota<S: Into<String>>(message: S) -> Self {
        Self::Ota {
            message: message.into(),
        }
    }

    /// Create command error
    pub fn command<S: Into<String>>(message: S) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short machine-readable code used in command responses
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::InvalidInput { .. } => "invalid_input",
            DeviceError::Sensor { .. } => "sensor_error",
            DeviceError::Analysis { .. } => "analysis_error",
            DeviceError::Storage { .. } | DeviceError::Io(_) => "storage_error",
            DeviceError::Ota { .. } => "ota_error",
            DeviceError::Command { .. } => "command_failed",
            DeviceError::Transport(_) => "transport_error",
            DeviceError::Config(_) => "config_error",
            DeviceError::Serialization(_) => "invalid_payload",
            DeviceError::Internal { .. } => "internal_error",
        }
    }

    /// Message safe to publish off-device
    pub fn public_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|certs?|\.ssh|\.aws|private)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_PUBLIC_MESSAGE_LEN: usize = 500;

/// Remove credentials and key material paths from a message and bound its length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(re) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "/***REDACTED***/").to_string();
    }

    if sanitized.len() > MAX_PUBLIC_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_PUBLIC_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_and_display() {
        assert_eq!(
            DeviceError::invalid_input("missing userId").to_string(),
            "Invalid input: missing userId"
        );
        assert_eq!(
            DeviceError::sensor("load cell timeout").to_string(),
            "Sensor error: load cell timeout"
        );
        assert_eq!(
            DeviceError::analysis("not enough peaks").to_string(),
            "Analysis error: not enough peaks"
        );
        assert_eq!(
            DeviceError::storage("disk full").to_string(),
            "Storage error: disk full"
        );
        assert_eq!(DeviceError::ota("bad size").to_string(), "OTA error: bad size");
        assert_eq!(
            DeviceError::command("unknown").to_string(),
            "Command failed: unknown"
        );
        assert_eq!(
            DeviceError::internal("unexpected state").to_string(),
            "Internal error: unexpected state"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DeviceError::invalid_input("x").code(), "invalid_input");
        assert_eq!(DeviceError::sensor("x").code(), "sensor_error");
        assert_eq!(DeviceError::ota("x").code(), "ota_error");
        let io = DeviceError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.code(), "storage_error");
    }

    #[test]
    fn test_public_message_is_sanitized() {
        let error = DeviceError::internal("TLS handshake failed: password=hunter2 token=abc456");
        let message = error.public_message();

        assert!(!message.contains("hunter2"));
        assert!(!message.contains("abc456"));
        assert!(message.contains("password=***"));
        assert!(message.contains("token=***"));
    }

    #[test]
    fn test_certificate_path_redaction() {
        let message = "Failed to read /etc/biotrack/certs/device.key";
        let sanitized = sanitize_error_message(message);

        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("device.key"));
    }

    #[test]
    fn test_long_message_truncation() {
        let long_message = "x".repeat(600);
        let sanitized = sanitize_error_message(&long_message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long_message = "Ω".repeat(400);
        let sanitized = sanitize_error_message(&long_message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_case_insensitive_and_colons() {
        let sanitized = sanitize_error_message("PASSWORD=abc Key: xyz");
        assert!(!sanitized.contains("abc"));
        assert!(!sanitized.contains("xyz"));
    }

    #[test]
    fn test_sanitize_empty_and_exact_length() {
        assert_eq!(sanitize_error_message(""), "");
        let exact = "y".repeat(500);
        assert_eq!(sanitize_error_message(&exact).len(), 500);
    }
}
