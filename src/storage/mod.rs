//! Local persistence for readings, alerts and device state

pub mod data_manager;

pub use data_manager::{
    evaluate_alert_rules, DataManager, HealthAlert, StorageStatistics, ALERTS_FILE,
    DEVICE_STATE_FILE, FAILED_MESSAGES_FILE, SENSOR_DATA_FILE,
};
