//! Sensor reading model and range validation
//!
//! A [`SensorReading`] is one sampling pass over every sensor. Each section
//! carries its own `valid` flag, set from the ranges below when the section
//! is measured.

use crate::vitals::blood_pressure::BloodPressureReading;
use crate::vitals::body_composition::BodyComposition;
use crate::vitals::glucose::GlucoseEstimate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const HEART_RATE_RANGE: (f64, f64) = (30.0, 220.0);
pub const SPO2_RANGE: (f64, f64) = (70.0, 100.0);
pub const TEMPERATURE_RANGE: (f64, f64) = (20.0, 45.0);
pub const WEIGHT_RANGE: (f64, f64) = (0.1, 500.0);
pub const IMPEDANCE_RANGE: (f64, f64) = (10.0, 10_000.0);

fn within((min, max): (f64, f64), value: f64) -> bool {
    value.is_finite() && value >= min && value <= max
}

pub fn validate_heart_rate(bpm: f64, spo2: f64) -> bool {
    within(HEART_RATE_RANGE, bpm) && within(SPO2_RANGE, spo2)
}

pub fn validate_temperature(celsius: f64) -> bool {
    within(TEMPERATURE_RANGE, celsius)
}

pub fn validate_weight(kg: f64) -> bool {
    within(WEIGHT_RANGE, kg)
}

pub fn validate_impedance(ohms: f64) -> bool {
    within(IMPEDANCE_RANGE, ohms)
}

pub fn validate_ecg(bpm: f64, filtered_value: f64) -> bool {
    within(HEART_RATE_RANGE, bpm) && filtered_value > 0.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartRateData {
    pub value: f64,
    pub unit: String,
    pub spo2: f64,
    pub valid: bool,
}

impl HeartRateData {
    pub fn measured(bpm: f64, spo2: f64) -> Self {
        Self {
            value: bpm,
            unit: "bpm".to_string(),
            spo2,
            valid: validate_heart_rate(bpm, spo2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureData {
    pub value: f64,
    pub unit: String,
    pub valid: bool,
}

impl TemperatureData {
    pub fn measured(celsius: f64) -> Self {
        Self {
            value: celsius,
            unit: "°C".to_string(),
            valid: validate_temperature(celsius),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeightData {
    pub value: f64,
    pub unit: String,
    pub stable: bool,
    pub valid: bool,
}

impl WeightData {
    pub fn measured(kg: f64, stable: bool) -> Self {
        Self {
            value: kg,
            unit: "kg".to_string(),
            stable,
            valid: validate_weight(kg),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BioimpedanceData {
    pub value: f64,
    pub unit: String,
    /// Hz
    pub frequency: f64,
    pub valid: bool,
}

impl BioimpedanceData {
    pub fn measured(ohms: f64, frequency: f64) -> Self {
        Self {
            value: ohms,
            unit: "Ω".to_string(),
            frequency,
            valid: validate_impedance(ohms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EcgData {
    pub bpm: f64,
    pub filtered_value: f64,
    pub leads_off: bool,
    pub valid: bool,
}

impl EcgData {
    pub fn measured(bpm: f64, filtered_value: f64, leads_off: bool) -> Self {
        Self {
            bpm,
            filtered_value,
            leads_off,
            valid: !leads_off && validate_ecg(bpm, filtered_value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BloodPressureData {
    #[serde(flatten)]
    pub reading: BloodPressureReading,
    pub unit: String,
}

impl From<BloodPressureReading> for BloodPressureData {
    fn from(reading: BloodPressureReading) -> Self {
        Self {
            reading,
            unit: "mmHg".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BodyCompositionData {
    pub body_fat_percentage: f64,
    pub muscle_mass_kg: f64,
    pub fat_free_mass_kg: f64,
    pub total_body_water_kg: f64,
    pub bone_mass_kg: f64,
    pub visceral_fat_level: f64,
    pub bmr_kcal: f64,
    pub metabolic_age: f64,
    pub phase_angle: f64,
    pub quality_score: f64,
    pub valid: bool,
}

impl From<&BodyComposition> for BodyCompositionData {
    fn from(c: &BodyComposition) -> Self {
        Self {
            body_fat_percentage: c.body_fat_percentage,
            muscle_mass_kg: c.muscle_mass_kg,
            fat_free_mass_kg: c.fat_free_mass_kg,
            total_body_water_kg: c.total_body_water_kg,
            bone_mass_kg: c.bone_mass_kg,
            visceral_fat_level: c.visceral_fat_level,
            bmr_kcal: c.bmr_kcal,
            metabolic_age: c.metabolic_age,
            phase_angle: c.phase_angle,
            quality_score: c.quality_score,
            valid: c.valid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseData {
    pub level: f64,
    pub unit: String,
    /// Signal quality of the optical window, 0-100
    pub confidence: f64,
    pub valid: bool,
}

impl From<&GlucoseEstimate> for GlucoseData {
    fn from(e: &GlucoseEstimate) -> Self {
        Self {
            level: e.level,
            unit: "mg/dL".to_string(),
            confidence: e.signal_quality,
            valid: e.valid,
        }
    }
}

/// One sampling pass over every sensor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub device_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<HeartRateData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<TemperatureData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<WeightData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bioimpedance: Option<BioimpedanceData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecg: Option<EcgData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blood_pressure: Option<BloodPressureData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_composition: Option<BodyCompositionData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glucose: Option<GlucoseData>,
}

/// One value ready to publish as telemetry
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEntry {
    pub sensor_type: &'static str,
    pub value: f64,
    pub unit: &'static str,
    pub valid: bool,
    /// 0-100 where the analyser reports one
    pub quality_score: Option<f64>,
    pub metadata: Value,
}

impl SensorReading {
    pub fn new(device_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            ..Default::default()
        }
    }

    /// True when any sensor produced a section this pass, valid or not
    pub fn has_measurements(&self) -> bool {
        self.heart_rate.is_some()
            || self.temperature.is_some()
            || self.weight.is_some()
            || self.bioimpedance.is_some()
            || self.ecg.is_some()
            || self.blood_pressure.is_some()
            || self.body_composition.is_some()
            || self.glucose.is_some()
    }

    /// True when at least one section holds a valid measurement
    pub fn is_valid(&self) -> bool {
        self.heart_rate.as_ref().is_some_and(|d| d.valid)
            || self.temperature.as_ref().is_some_and(|d| d.valid)
            || self.weight.as_ref().is_some_and(|d| d.valid)
            || self.bioimpedance.as_ref().is_some_and(|d| d.valid)
            || self.ecg.as_ref().is_some_and(|d| d.valid)
            || self.blood_pressure.as_ref().is_some_and(|d| d.reading.valid)
            || self.body_composition.as_ref().is_some_and(|d| d.valid)
            || self.glucose.as_ref().is_some_and(|d| d.valid)
    }

    /// Flatten into per-sensor telemetry values
    pub fn telemetry_entries(&self) -> Vec<TelemetryEntry> {
        let mut entries = Vec::new();

        if let Some(hr) = &self.heart_rate {
            entries.push(TelemetryEntry {
                sensor_type: "heart_rate",
                value: hr.value,
                unit: "bpm",
                valid: hr.valid,
                quality_score: None,
                metadata: Value::Null,
            });
            entries.push(TelemetryEntry {
                sensor_type: "spo2",
                value: hr.spo2,
                unit: "%",
                valid: hr.valid,
                quality_score: None,
                metadata: json!({ "heartRate": hr.value }),
            });
        }
        if let Some(t) = &self.temperature {
            entries.push(TelemetryEntry {
                sensor_type: "temperature",
                value: t.value,
                unit: "°C",
                valid: t.valid,
                quality_score: None,
                metadata: Value::Null,
            });
        }
        if let Some(w) = &self.weight {
            entries.push(TelemetryEntry {
                sensor_type: "weight",
                value: w.value,
                unit: "kg",
                valid: w.valid,
                quality_score: None,
                metadata: json!({ "stable": w.stable }),
            });
        }
        if let Some(b) = &self.bioimpedance {
            entries.push(TelemetryEntry {
                sensor_type: "bioimpedance",
                value: b.value,
                unit: "Ω",
                valid: b.valid,
                quality_score: None,
                metadata: json!({ "frequency": b.frequency }),
            });
        }
        if let Some(e) = &self.ecg {
            entries.push(TelemetryEntry {
                sensor_type: "ecg",
                value: e.bpm,
                unit: "bpm",
                valid: e.valid,
                quality_score: None,
                metadata: json!({ "filteredValue": e.filtered_value, "leadsOff": e.leads_off }),
            });
        }
        if let Some(bp) = &self.blood_pressure {
            let r = &bp.reading;
            entries.push(TelemetryEntry {
                sensor_type: "blood_pressure",
                value: r.systolic,
                unit: "mmHg",
                valid: r.valid,
                quality_score: Some(r.signal_quality),
                metadata: json!({
                    "diastolic": r.diastolic,
                    "meanArterialPressure": r.mean_arterial_pressure,
                    "pulseTransitTime": r.pulse_transit_time,
                    "category": r.category().as_str(),
                }),
            });
        }
        if let Some(c) = &self.body_composition {
            entries.push(TelemetryEntry {
                sensor_type: "body_composition",
                value: c.body_fat_percentage,
                unit: "%",
                valid: c.valid,
                quality_score: Some(c.quality_score),
                metadata: json!({
                    "muscleMassKg": c.muscle_mass_kg,
                    "totalBodyWaterKg": c.total_body_water_kg,
                    "visceralFatLevel": c.visceral_fat_level,
                    "bmrKcal": c.bmr_kcal,
                }),
            });
        }
        if let Some(g) = &self.glucose {
            entries.push(TelemetryEntry {
                sensor_type: "glucose",
                value: g.level,
                unit: "mg/dL",
                valid: g.valid,
                quality_score: Some(g.confidence),
                metadata: Value::Null,
            });
        }

        entries
    }
}
