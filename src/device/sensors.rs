//! Sensor sources and the sampling hub
//!
//! [`SensorSource`] is the seam between the runtime and sensor hardware.
//! [`SimulatedSensors`] produces deterministic waveforms for host runs and
//! tests. [`SensorHub`] owns a source plus the analysers and turns one
//! sampling pass into a [`SensorReading`].

use crate::config::{SensorSection, UserProfile};
use crate::error::{DeviceError, DeviceResult};
use crate::vitals::readings::{
    BioimpedanceData, BloodPressureData, BodyCompositionData, EcgData, GlucoseData, HeartRateData,
    TemperatureData, WeightData,
};
use crate::vitals::body_composition::{
    bmi, interpret_phase_angle, reference_ranges, BmiCategory, BodyFatCategory, ReferenceRanges,
};
use crate::vitals::{
    BiaMeasurement, BloodPressureMonitor, BodyCompositionAnalyzer, GlucoseEstimator, SensorReading,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::f64::consts::PI;
use tracing::{debug, warn};

/// Frequencies of the bio-impedance sweep, in Hz
pub const BIA_SWEEP_FREQUENCIES: [f64; 4] = [5_000.0, 50_000.0, 100_000.0, 200_000.0];

/// Sensors `test_sensor` with `"all"` exercises
pub const TESTABLE_SENSORS: [&str; 4] = ["temperature", "weight", "bioimpedance", "spo2"];

const WAVEFORM_STEP_MS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartRateSample {
    pub bpm: f64,
    pub spo2: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSample {
    pub kg: f64,
    pub stable: bool,
}

/// One timestamped sample of the ECG lead and both PPG channels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformSample {
    pub timestamp_ms: u64,
    pub ecg: f64,
    pub ppg_ir: f64,
    pub ppg_red: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpticalSample {
    pub ir: f64,
    pub red: f64,
}

/// Source of raw sensor values
#[async_trait]
pub trait SensorSource: Send + Sync {
    fn name(&self) -> &str;

    async fn read_heart_rate(&mut self) -> DeviceResult<HeartRateSample>;

    /// Body temperature in °C
    async fn read_temperature(&mut self) -> DeviceResult<f64>;

    async fn read_weight(&mut self) -> DeviceResult<WeightSample>;

    async fn read_bioimpedance(&mut self, frequency_hz: f64) -> DeviceResult<BiaMeasurement>;

    /// Contiguous ECG/PPG samples covering `duration_ms`
    async fn read_ecg_ppg_window(&mut self, duration_ms: u64) -> DeviceResult<Vec<WaveformSample>>;

    /// A burst of optical samples large enough to fill the glucose window
    async fn read_glucose_optical(&mut self) -> DeviceResult<Vec<OpticalSample>>;

    async fn tare_weight(&mut self) -> DeviceResult<()>;
}

/// Deterministic stand-in for the sensor front end
///
/// ECG R-peaks arrive every 800 ms and the PPG pulse follows 65 ms later,
/// sampled at 100 Hz. The waveform clock runs continuously across windows.
#[derive(Debug, Clone)]
pub struct SimulatedSensors {
    tick: u64,
    waveform_clock_ms: u64,
    base_weight_kg: f64,
    tare_count: u32,
}

impl SimulatedSensors {
    pub const BEAT_PERIOD_MS: f64 = 800.0;
    pub const PULSE_TRANSIT_MS: f64 = 65.0;

    pub fn new(base_weight_kg: f64) -> Self {
        Self {
            tick: 0,
            waveform_clock_ms: 0,
            base_weight_kg,
            tare_count: 0,
        }
    }

    fn next_tick(&mut self) -> f64 {
        self.tick += 1;
        self.tick as f64
    }

    /// Signed distance from `t` to the nearest beat centred on `center`
    fn beat_offset(t: f64, center: f64) -> f64 {
        let period = Self::BEAT_PERIOD_MS;
        (t - center + period / 2.0).rem_euclid(period) - period / 2.0
    }

    fn pulse(offset: f64, width: f64) -> f64 {
        (-(offset * offset) / (2.0 * width * width)).exp()
    }

    fn waveform_at(t_ms: u64) -> WaveformSample {
        let t = t_ms as f64;
        let r_peak = Self::BEAT_PERIOD_MS / 2.0;
        let ecg_pulse = Self::pulse(Self::beat_offset(t, r_peak), 25.0);
        let ppg_pulse = Self::pulse(Self::beat_offset(t, r_peak + Self::PULSE_TRANSIT_MS), 40.0);

        WaveformSample {
            timestamp_ms: t_ms,
            ecg: 800.0 + 2500.0 * ecg_pulse,
            ppg_ir: 20_000.0 + 60_000.0 * ppg_pulse,
            ppg_red: 18_000.0 + 30_000.0 * ppg_pulse,
        }
    }

    /// Resistance and reactance of a healthy adult at `frequency_hz`
    fn impedance_at(frequency_hz: f64) -> (f64, f64) {
        const TABLE: [(f64, f64, f64); 4] = [
            (5_000.0, 520.0, 45.0),
            (50_000.0, 500.0, 52.0),
            (100_000.0, 490.0, 50.0),
            (200_000.0, 480.0, 44.0),
        ];
        let nearest = TABLE
            .iter()
            .min_by(|a, b| {
                (a.0 - frequency_hz)
                    .abs()
                    .total_cmp(&(b.0 - frequency_hz).abs())
            })
            .copied()
            .unwrap_or(TABLE[1]);
        (nearest.1, nearest.2)
    }
}

impl Default for SimulatedSensors {
    fn default() -> Self {
        Self::new(70.0)
    }
}

#[async_trait]
impl SensorSource for SimulatedSensors {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn read_heart_rate(&mut self) -> DeviceResult<HeartRateSample> {
        let k = self.next_tick();
        Ok(HeartRateSample {
            bpm: 72.0 + 6.0 * (k * 0.3).sin(),
            spo2: 97.5 + (k * 0.2).sin(),
        })
    }

    async fn read_temperature(&mut self) -> DeviceResult<f64> {
        let k = self.next_tick();
        Ok(36.6 + 0.2 * (k * 0.1).sin())
    }

    async fn read_weight(&mut self) -> DeviceResult<WeightSample> {
        let k = self.next_tick();
        Ok(WeightSample {
            kg: self.base_weight_kg + 0.05 * (k * 0.5).sin(),
            stable: true,
        })
    }

    async fn read_bioimpedance(&mut self, frequency_hz: f64) -> DeviceResult<BiaMeasurement> {
        if frequency_hz <= 0.0 {
            return Err(DeviceError::invalid_input(format!(
                "Invalid BIA frequency {frequency_hz}"
            )));
        }
        let k = self.next_tick();
        let (resistance, reactance) = Self::impedance_at(frequency_hz);
        Ok(BiaMeasurement::new(
            resistance + 2.0 * (k * 2.0 * PI / 7.0).sin(),
            reactance,
            frequency_hz,
        ))
    }

    async fn read_ecg_ppg_window(&mut self, duration_ms: u64) -> DeviceResult<Vec<WaveformSample>> {
        let start = self.waveform_clock_ms;
        let end = start + duration_ms;
        let samples = (start..end)
            .step_by(WAVEFORM_STEP_MS as usize)
            .map(Self::waveform_at)
            .collect();
        self.waveform_clock_ms = end;
        Ok(samples)
    }

    async fn read_glucose_optical(&mut self) -> DeviceResult<Vec<OpticalSample>> {
        Ok((0..crate::vitals::glucose::GLUCOSE_WINDOW_SIZE)
            .map(|k| {
                let k = k as f64;
                OpticalSample {
                    ir: 30_000.0 * (1.0 + 0.06 * k),
                    red: 60_000.0 * (1.0 + 0.02 * k),
                }
            })
            .collect())
    }

    async fn tare_weight(&mut self) -> DeviceResult<()> {
        self.tare_count += 1;
        debug!(tare_count = self.tare_count, "Simulated scale tared");
        Ok(())
    }
}

/// Result of a `test_sensor` run
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SensorTestResult {
    pub sensor: &'static str,
    pub value: f64,
    pub unit: &'static str,
    pub status: &'static str,
}

impl SensorTestResult {
    fn new(sensor: &'static str, value: f64, unit: &'static str, valid: bool) -> Self {
        Self {
            sensor,
            value,
            unit,
            status: if valid { "ok" } else { "out_of_range" },
        }
    }
}

/// Per-sensor due times
#[derive(Debug, Clone)]
struct Schedule {
    intervals: HashMap<&'static str, u64>,
    last_run: HashMap<&'static str, i64>,
}

impl Schedule {
    fn from_config(sensors: &SensorSection) -> Self {
        let intervals = HashMap::from([
            ("heart_rate", sensors.heart_rate_interval_ms),
            ("temperature", sensors.temperature_interval_ms),
            ("weight", sensors.weight_interval_ms),
            ("bioimpedance", sensors.bioimpedance_interval_ms),
            ("ecg", sensors.ecg_interval_ms),
            ("glucose", sensors.glucose_interval_ms),
        ]);
        Self {
            intervals,
            last_run: HashMap::new(),
        }
    }

    /// True (and marks the run) when the sensor has never run or its interval elapsed
    fn take_if_due(&mut self, sensor: &'static str, now_ms: i64) -> bool {
        let interval = self.intervals.get(sensor).copied().unwrap_or(1000) as i64;
        let due = self
            .last_run
            .get(sensor)
            .map_or(true, |last| now_ms - last >= interval);
        if due {
            self.last_run.insert(sensor, now_ms);
        }
        due
    }
}

/// Source plus analysers; one call to [`SensorHub::sample_all`] per tick
pub struct SensorHub<S: SensorSource> {
    device_id: String,
    source: S,
    ecg_window_ms: u64,
    schedule: Schedule,
    blood_pressure: BloodPressureMonitor,
    body_composition: BodyCompositionAnalyzer,
    glucose: GlucoseEstimator,
    last_weight_kg: Option<f64>,
    calibrations: HashMap<String, i64>,
}

impl<S: SensorSource> SensorHub<S> {
    pub fn new(
        device_id: impl Into<String>,
        source: S,
        sensors: &SensorSection,
        profile: UserProfile,
    ) -> Self {
        let mut blood_pressure = BloodPressureMonitor::new();
        blood_pressure.set_personal_parameters(
            profile.age,
            profile.height_cm,
            profile.sex.is_male(),
        );

        Self {
            device_id: device_id.into(),
            source,
            ecg_window_ms: sensors.ecg_interval_ms,
            schedule: Schedule::from_config(sensors),
            blood_pressure,
            body_composition: BodyCompositionAnalyzer::new(profile),
            glucose: GlucoseEstimator::new(),
            last_weight_kg: None,
            calibrations: HashMap::new(),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn blood_pressure(&self) -> &BloodPressureMonitor {
        &self.blood_pressure
    }

    pub fn body_composition(&self) -> &BodyCompositionAnalyzer {
        &self.body_composition
    }

    pub fn last_weight_kg(&self) -> Option<f64> {
        self.last_weight_kg
    }

    pub fn set_user_profile(&mut self, profile: UserProfile) {
        self.blood_pressure
            .set_personal_parameters(profile.age, profile.height_cm, profile.sex.is_male());
        self.body_composition.set_profile(profile);
    }

    /// Read every sensor that is due and run the analysers
    ///
    /// A failing sensor is logged and left out of the reading.
    pub async fn sample_all(&mut self, now_ms: i64) -> SensorReading {
        let mut reading = SensorReading::new(self.device_id.clone(), now_ms);

        if self.schedule.take_if_due("heart_rate", now_ms) {
            match self.source.read_heart_rate().await {
                Ok(hr) => reading.heart_rate = Some(HeartRateData::measured(hr.bpm, hr.spo2)),
                Err(e) => warn!(error = %e, "Heart rate read failed"),
            }
        }

        if self.schedule.take_if_due("temperature", now_ms) {
            match self.source.read_temperature().await {
                Ok(celsius) => reading.temperature = Some(TemperatureData::measured(celsius)),
                Err(e) => warn!(error = %e, "Temperature read failed"),
            }
        }

        if self.schedule.take_if_due("weight", now_ms) {
            match self.source.read_weight().await {
                Ok(w) => {
                    let data = WeightData::measured(w.kg, w.stable);
                    if data.valid && w.stable {
                        self.last_weight_kg = Some(w.kg);
                    }
                    reading.weight = Some(data);
                }
                Err(e) => warn!(error = %e, "Weight read failed"),
            }
        }

        if self.schedule.take_if_due("bioimpedance", now_ms) {
            self.sample_bioimpedance(&mut reading).await;
        }

        if self.schedule.take_if_due("ecg", now_ms) {
            self.sample_ecg(&mut reading).await;
        }

        if self.schedule.take_if_due("glucose", now_ms) {
            self.sample_glucose(&mut reading).await;
        }

        reading
    }

    async fn sample_bioimpedance(&mut self, reading: &mut SensorReading) {
        let mut sweep = Vec::with_capacity(BIA_SWEEP_FREQUENCIES.len());
        for frequency in BIA_SWEEP_FREQUENCIES {
            match self.source.read_bioimpedance(frequency).await {
                Ok(m) => sweep.push(m),
                Err(e) => warn!(error = %e, frequency, "Bio-impedance read failed"),
            }
        }

        if let Some(primary) = sweep.iter().find(|m| m.frequency_hz == 50_000.0) {
            reading.bioimpedance = Some(BioimpedanceData::measured(
                primary.magnitude,
                primary.frequency_hz,
            ));
        }

        match self.body_composition.analyze(&sweep, self.last_weight_kg) {
            Ok(composition) => {
                reading.body_composition = Some(BodyCompositionData::from(&composition))
            }
            Err(e) => debug!(error = %e, "Body composition unavailable"),
        }
    }

    async fn sample_ecg(&mut self, reading: &mut SensorReading) {
        let window = match self.source.read_ecg_ppg_window(self.ecg_window_ms).await {
            Ok(window) => window,
            Err(e) => {
                warn!(error = %e, "ECG/PPG window read failed");
                return;
            }
        };

        for sample in &window {
            self.blood_pressure.add_ecg_sample(sample.ecg, sample.timestamp_ms);
            self.blood_pressure
                .add_ppg_sample(sample.ppg_ir, sample.ppg_red, sample.timestamp_ms);
        }

        let rr = self.blood_pressure.rr_intervals();
        if !rr.is_empty() {
            let mean_rr = rr.iter().sum::<f64>() / rr.len() as f64;
            let last_value = window.last().map(|s| s.ecg).unwrap_or(0.0);
            reading.ecg = Some(EcgData::measured(60_000.0 / mean_rr, last_value, false));
        }

        match self.blood_pressure.calculate() {
            Ok(bp) => reading.blood_pressure = Some(BloodPressureData::from(bp)),
            Err(e) => debug!(error = %e, "Blood pressure unavailable"),
        }
    }

    async fn sample_glucose(&mut self, reading: &mut SensorReading) {
        let burst = match self.source.read_glucose_optical().await {
            Ok(burst) => burst,
            Err(e) => {
                warn!(error = %e, "Optical glucose read failed");
                return;
            }
        };

        for sample in burst {
            if let Err(rejection) = self.glucose.add_sample(sample.ir, sample.red) {
                debug!(?rejection, ir = sample.ir, red = sample.red, "Optical sample rejected");
            }
        }

        if let Some(estimate) = self.glucose.estimate() {
            reading.glucose = Some(GlucoseData::from(&estimate));
        }
    }

    /// Probe one sensor, or every testable sensor for `"all"`
    pub async fn test_sensor(&mut self, sensor: &str) -> DeviceResult<Vec<SensorTestResult>> {
        let targets: Vec<&str> = if sensor == "all" {
            TESTABLE_SENSORS.to_vec()
        } else {
            vec![sensor]
        };

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let result = match target {
                "temperature" => {
                    let t = TemperatureData::measured(self.source.read_temperature().await?);
                    SensorTestResult::new("temperature", t.value, "°C", t.valid)
                }
                "weight" => {
                    let w = self.source.read_weight().await?;
                    let data = WeightData::measured(w.kg, w.stable);
                    SensorTestResult::new("weight", data.value, "kg", data.valid)
                }
                "bioimpedance" => {
                    let m = self.source.read_bioimpedance(50_000.0).await?;
                    let data = BioimpedanceData::measured(m.magnitude, m.frequency_hz);
                    SensorTestResult::new("bioimpedance", data.value, "Ω", data.valid)
                }
                "spo2" => {
                    let hr = self.source.read_heart_rate().await?;
                    let data = HeartRateData::measured(hr.bpm, hr.spo2);
                    SensorTestResult::new("spo2", data.spo2, "%", data.valid)
                }
                "heart_rate" => {
                    let hr = self.source.read_heart_rate().await?;
                    let data = HeartRateData::measured(hr.bpm, hr.spo2);
                    SensorTestResult::new("heart_rate", data.value, "bpm", data.valid)
                }
                other => {
                    return Err(DeviceError::invalid_input(format!(
                        "Unknown sensor type: {other}"
                    )))
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Calibrate a sensor and record when it happened
    ///
    /// `weight` tares the scale. `blood_pressure` takes a cuff reference from
    /// `systolic`/`diastolic`, or clears the calibration when `reset` is set.
    pub async fn calibrate(
        &mut self,
        sensor: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        now_ms: i64,
    ) -> DeviceResult<String> {
        let message = match sensor {
            "weight" => {
                self.source.tare_weight().await?;
                "Weight sensor tared".to_string()
            }
            "blood_pressure" => {
                if params.get("reset").and_then(|v| v.as_bool()).unwrap_or(false) {
                    self.blood_pressure.clear_calibration();
                    "Blood pressure calibration cleared".to_string()
                } else {
                    let systolic = params.get("systolic").and_then(|v| v.as_f64());
                    let diastolic = params.get("diastolic").and_then(|v| v.as_f64());
                    let (Some(systolic), Some(diastolic)) = (systolic, diastolic) else {
                        return Err(DeviceError::invalid_input(
                            "Blood pressure calibration requires systolic and diastolic",
                        ));
                    };
                    self.blood_pressure.add_calibration_point(systolic, diastolic)?;
                    format!(
                        "Blood pressure calibration point recorded ({} of 5)",
                        self.blood_pressure.calibration_points().len()
                    )
                }
            }
            "temperature" | "bioimpedance" | "spo2" | "heart_rate" | "ecg" | "glucose" => {
                format!("Sensor {sensor} calibrated")
            }
            other => {
                return Err(DeviceError::invalid_input(format!(
                    "Unknown sensor type: {other}"
                )))
            }
        };

        self.calibrations.insert(sensor.to_string(), now_ms);
        Ok(message)
    }

    pub fn is_calibrated(&self, sensor: &str) -> bool {
        match sensor {
            "blood_pressure" => self.blood_pressure.is_calibrated(),
            other => self.calibrations.contains_key(other),
        }
    }

    pub fn last_calibration(&self, sensor: &str) -> Option<i64> {
        self.calibrations.get(sensor).copied()
    }
}

/// Result of replaying the sensors offline
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSummary {
    pub simulated_seconds: u64,
    pub valid_readings: usize,
    pub heart_rate: Option<HeartRateData>,
    pub blood_pressure: Option<BloodPressureData>,
    pub blood_pressure_category: Option<&'static str>,
    pub body_composition: Option<BodyCompositionData>,
    pub glucose: Option<GlucoseData>,
    pub assessment: Option<BodyAssessment>,
}

/// Human-readable interpretation of the last body composition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyAssessment {
    pub bmi: f64,
    pub bmi_category: BmiCategory,
    pub body_fat_category: BodyFatCategory,
    pub phase_angle: &'static str,
    pub reference_ranges: ReferenceRanges,
}

impl BodyAssessment {
    fn new(
        analyzer: &BodyCompositionAnalyzer,
        weight_kg: f64,
        composition: &BodyCompositionData,
    ) -> Self {
        let profile = analyzer.profile();
        Self {
            bmi: bmi(weight_kg, profile.height_cm),
            bmi_category: analyzer.bmi_category(weight_kg),
            body_fat_category: BodyFatCategory::classify(
                composition.body_fat_percentage,
                profile.sex,
            ),
            phase_angle: interpret_phase_angle(composition.phase_angle),
            reference_ranges: reference_ranges(profile.age, profile.sex),
        }
    }
}

/// Run `seconds` of one-second sampling passes and keep the latest analyses
pub async fn analyze_offline<S: SensorSource>(
    hub: &mut SensorHub<S>,
    seconds: u64,
) -> OfflineSummary {
    let mut summary = OfflineSummary {
        simulated_seconds: seconds,
        valid_readings: 0,
        heart_rate: None,
        blood_pressure: None,
        blood_pressure_category: None,
        body_composition: None,
        glucose: None,
        assessment: None,
    };

    for second in 0..seconds {
        let reading = hub.sample_all(second as i64 * 1000).await;
        if reading.is_valid() {
            summary.valid_readings += 1;
        }
        if let Some(hr) = reading.heart_rate {
            summary.heart_rate = Some(hr);
        }
        if let Some(bp) = reading.blood_pressure {
            summary.blood_pressure_category = Some(bp.reading.category().as_str());
            summary.blood_pressure = Some(bp);
        }
        if let Some(composition) = reading.body_composition {
            summary.body_composition = Some(composition);
        }
        if let Some(glucose) = reading.glucose {
            summary.glucose = Some(glucose);
        }
    }

    if let Some(composition) = &summary.body_composition {
        let analyzer = hub.body_composition();
        let weight = hub.last_weight_kg().unwrap_or(analyzer.profile().weight_kg);
        summary.assessment = Some(BodyAssessment::new(analyzer, weight, composition));
    }
    summary
}
