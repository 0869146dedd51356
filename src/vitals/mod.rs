//! On-device vital sign analysis
//!
//! - [`signal`] - filters, ring buffers and peak detection
//! - [`blood_pressure`] - cuffless blood pressure from pulse transit time
//! - [`body_composition`] - multi-frequency bio-impedance analysis
//! - [`glucose`] - optical glucose estimate
//! - [`readings`] - the sensor reading model and its range checks

pub mod blood_pressure;
pub mod body_composition;
pub mod glucose;
pub mod readings;
pub mod signal;

pub use blood_pressure::{BloodPressureMonitor, BloodPressureReading, BpCategory};
pub use body_composition::{BiaMeasurement, BodyComposition, BodyCompositionAnalyzer};
pub use glucose::{GlucoseEstimate, GlucoseEstimator};
pub use readings::{SensorReading, TelemetryEntry};
