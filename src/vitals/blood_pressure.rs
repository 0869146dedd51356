//! Cuffless blood pressure from pulse transit time
//!
//! ECG R-peaks mark the start of each beat and the PPG pulse peak marks its
//! arrival at the finger. The delay between the two (pulse transit time,
//! PTT) shrinks as arterial pressure rises, so a linear PTT model gives a
//! systolic and diastolic estimate. Without calibration points the model is
//! a population default adjusted for age, sex and height.

use crate::error::{DeviceError, DeviceResult};
use crate::vitals::signal::{
    adaptive_threshold, mean_and_std_dev, BandpassFilter, PeakDetector, RingBuffer,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const BP_BUFFER_SIZE: usize = 200;
const PEAK_HISTORY: usize = 20;
const RR_HISTORY: usize = 50;
const MAX_CALIBRATION_POINTS: usize = 5;

const ECG_DEFAULT_THRESHOLD: f64 = 1500.0;
const ECG_MIN_PEAK_INTERVAL_MS: u64 = 300;
const PPG_DEFAULT_THRESHOLD: f64 = 50_000.0;
const PPG_MIN_PEAK_INTERVAL_MS: u64 = 400;

const RR_MIN_MS: f64 = 300.0;
const RR_MAX_MS: f64 = 2000.0;
const PTT_MIN_MS: f64 = 50.0;
const PTT_MAX_MS: f64 = 400.0;
/// ECG peaks considered when pairing with PPG peaks
const PTT_PAIRING_WINDOW: usize = 10;

const THRESHOLD_UPDATE_INTERVAL_MS: u64 = 5000;
const STALE_READING_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub value: f64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationPoint {
    pub ptt: f64,
    pub systolic: f64,
    pub diastolic: f64,
    pub timestamp_ms: u64,
}

/// Linear PTT model: `bp = slope * ptt + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BpModel {
    pub systolic_slope: f64,
    pub systolic_intercept: f64,
    pub diastolic_slope: f64,
    pub diastolic_intercept: f64,
}

impl Default for BpModel {
    fn default() -> Self {
        Self {
            systolic_slope: -1.2,
            systolic_intercept: 180.0,
            diastolic_slope: -0.8,
            diastolic_intercept: 120.0,
        }
    }
}

impl BpModel {
    pub fn systolic(&self, ptt: f64) -> f64 {
        self.systolic_slope * ptt + self.systolic_intercept
    }

    pub fn diastolic(&self, ptt: f64) -> f64 {
        self.diastolic_slope * ptt + self.diastolic_intercept
    }

    /// Least-squares fit over the calibration points; None with fewer than
    /// two points or when every point has the same PTT
    pub fn fit(points: &[CalibrationPoint]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }

        let n = points.len() as f64;
        let sum_x: f64 = points.iter().map(|p| p.ptt).sum();
        let sum_x2: f64 = points.iter().map(|p| p.ptt * p.ptt).sum();
        let sum_sys: f64 = points.iter().map(|p| p.systolic).sum();
        let sum_dia: f64 = points.iter().map(|p| p.diastolic).sum();
        let sum_x_sys: f64 = points.iter().map(|p| p.ptt * p.systolic).sum();
        let sum_x_dia: f64 = points.iter().map(|p| p.ptt * p.diastolic).sum();

        let denominator = n * sum_x2 - sum_x * sum_x;
        if denominator.abs() < f64::EPSILON {
            return None;
        }

        let systolic_slope = (n * sum_x_sys - sum_x * sum_sys) / denominator;
        let diastolic_slope = (n * sum_x_dia - sum_x * sum_dia) / denominator;
        Some(Self {
            systolic_slope,
            systolic_intercept: (sum_sys - systolic_slope * sum_x) / n,
            diastolic_slope,
            diastolic_intercept: (sum_dia - diastolic_slope * sum_x) / n,
        })
    }
}

/// Personal parameters that shape the default model and the compensation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersonalParameters {
    pub age: u32,
    pub height_cm: f64,
    pub male: bool,
}

impl Default for PersonalParameters {
    fn default() -> Self {
        Self {
            age: 30,
            height_cm: 170.0,
            male: true,
        }
    }
}

/// Age compensation: +0.5 % per year over 30
pub fn compensate_for_age(raw: f64, age: u32) -> f64 {
    raw * (1.0 + (age as f64 - 30.0) * 0.005)
}

pub fn compensate_for_sex(raw: f64, male: bool) -> f64 {
    if male {
        raw * 1.02
    } else {
        raw
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BloodPressureReading {
    pub systolic: f64,
    pub diastolic: f64,
    pub mean_arterial_pressure: f64,
    pub pulse_transit_time: f64,
    pub pulse_wave_velocity: f64,
    pub heart_rate_variability: f64,
    pub signal_quality: f64,
    pub correlation: f64,
    pub rhythm_regular: bool,
    pub needs_calibration: bool,
    pub valid: bool,
    pub timestamp: u64,
}

impl BloodPressureReading {
    pub fn category(&self) -> BpCategory {
        BpCategory::classify(self.systolic, self.diastolic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BpCategory {
    Normal,
    Elevated,
    Stage1Hypertension,
    Stage2Hypertension,
    HypertensiveCrisis,
}

impl BpCategory {
    pub fn classify(systolic: f64, diastolic: f64) -> Self {
        if systolic < 120.0 && diastolic < 80.0 {
            BpCategory::Normal
        } else if systolic < 130.0 && diastolic < 80.0 {
            BpCategory::Elevated
        } else if systolic < 140.0 || diastolic < 90.0 {
            BpCategory::Stage1Hypertension
        } else if systolic < 180.0 || diastolic < 120.0 {
            BpCategory::Stage2Hypertension
        } else {
            BpCategory::HypertensiveCrisis
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BpCategory::Normal => "Normal",
            BpCategory::Elevated => "Elevated",
            BpCategory::Stage1Hypertension => "Stage 1 Hypertension",
            BpCategory::Stage2Hypertension => "Stage 2 Hypertension",
            BpCategory::HypertensiveCrisis => "Hypertensive Crisis",
        }
    }
}

pub fn is_hypertensive(systolic: f64, diastolic: f64) -> bool {
    systolic >= 130.0 || diastolic >= 80.0
}

pub fn pulse_pressure(systolic: f64, diastolic: f64) -> f64 {
    systolic - diastolic
}

/// One filtered, peak-tracked signal channel
#[derive(Debug, Clone)]
struct Channel {
    filter: BandpassFilter,
    buffer: RingBuffer<f64>,
    detector: PeakDetector,
    peaks: RingBuffer<Peak>,
    default_threshold: f64,
}

impl Channel {
    fn new(threshold: f64, min_interval_ms: u64) -> Self {
        Self {
            filter: BandpassFilter::new(),
            buffer: RingBuffer::new(BP_BUFFER_SIZE),
            detector: PeakDetector::new(threshold, min_interval_ms),
            peaks: RingBuffer::new(PEAK_HISTORY),
            default_threshold: threshold,
        }
    }

    /// Returns the peak detected on this sample, if any
    fn add_sample(&mut self, raw: f64, timestamp_ms: u64) -> Option<Peak> {
        let filtered = self.filter.apply(raw);
        self.buffer.push(filtered);
        if self.detector.process(filtered, timestamp_ms) {
            let peak = Peak {
                value: filtered,
                timestamp_ms,
            };
            self.peaks.push(peak);
            Some(peak)
        } else {
            None
        }
    }

    /// Peaks ever detected, not just those still held
    fn peak_count(&self) -> u64 {
        self.peaks.total_pushed()
    }

    fn reset(&mut self) {
        self.filter.reset();
        self.buffer.clear();
        self.detector.reset();
        self.detector.set_threshold(self.default_threshold);
        self.peaks.clear();
    }
}

/// Streaming PTT blood pressure estimator
#[derive(Debug, Clone)]
pub struct BloodPressureMonitor {
    ecg: Channel,
    ppg: Channel,
    rr_intervals: RingBuffer<f64>,
    calibration_points: RingBuffer<CalibrationPoint>,
    default_model: BpModel,
    calibrated_model: Option<BpModel>,
    personal: PersonalParameters,
    adaptive_thresholding: bool,
    last_threshold_update_ms: u64,
    last_valid_reading_ms: Option<u64>,
    latest_sample_ms: u64,
}

impl Default for BloodPressureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl BloodPressureMonitor {
    pub fn new() -> Self {
        Self {
            ecg: Channel::new(ECG_DEFAULT_THRESHOLD, ECG_MIN_PEAK_INTERVAL_MS),
            ppg: Channel::new(PPG_DEFAULT_THRESHOLD, PPG_MIN_PEAK_INTERVAL_MS),
            rr_intervals: RingBuffer::new(RR_HISTORY),
            calibration_points: RingBuffer::new(MAX_CALIBRATION_POINTS),
            default_model: BpModel::default(),
            calibrated_model: None,
            personal: PersonalParameters::default(),
            adaptive_thresholding: true,
            last_threshold_update_ms: 0,
            last_valid_reading_ms: None,
            latest_sample_ms: 0,
        }
    }

    pub fn set_adaptive_thresholding(&mut self, enabled: bool) {
        self.adaptive_thresholding = enabled;
    }

    /// Rebuild the default model for this person
    pub fn set_personal_parameters(&mut self, age: u32, height_cm: f64, male: bool) {
        let mut model = BpModel::default();
        if age > 60 {
            model.systolic_slope *= 1.1;
            model.diastolic_slope *= 1.05;
        }
        if !male {
            model.systolic_intercept -= 5.0;
            model.diastolic_intercept -= 3.0;
        }
        if height_cm > 180.0 {
            model.systolic_intercept += 3.0;
        } else if height_cm < 160.0 {
            model.systolic_intercept -= 3.0;
        }

        self.default_model = model;
        self.personal = PersonalParameters {
            age,
            height_cm,
            male,
        };
        debug!(age = age, height_cm = height_cm, male = male, "Blood pressure profile updated");
    }

    pub fn add_ecg_sample(&mut self, value: f64, timestamp_ms: u64) {
        self.latest_sample_ms = self.latest_sample_ms.max(timestamp_ms);
        let previous = self.ecg.peaks.latest().copied();

        if let Some(peak) = self.ecg.add_sample(value, timestamp_ms) {
            if let Some(prev) = previous {
                let rr = peak.timestamp_ms.saturating_sub(prev.timestamp_ms) as f64;
                if rr > RR_MIN_MS && rr < RR_MAX_MS {
                    self.rr_intervals.push(rr);
                }
            }
        }

        if self.adaptive_thresholding {
            self.update_adaptive_thresholds(timestamp_ms);
        }
    }

    /// IR channel drives pulse detection; red is accepted for interface parity
    pub fn add_ppg_sample(&mut self, ir: f64, _red: f64, timestamp_ms: u64) {
        self.latest_sample_ms = self.latest_sample_ms.max(timestamp_ms);
        self.ppg.add_sample(ir, timestamp_ms);
    }

    /// Re-derive peak thresholds from recent signal level, at most every 5 s
    pub fn update_adaptive_thresholds(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_threshold_update_ms) < THRESHOLD_UPDATE_INTERVAL_MS {
            return;
        }
        if let Some(threshold) = adaptive_threshold(self.ecg.buffer.iter()) {
            self.ecg.detector.set_threshold(threshold);
        }
        if let Some(threshold) = adaptive_threshold(self.ppg.buffer.iter()) {
            self.ppg.detector.set_threshold(threshold);
        }
        self.last_threshold_update_ms = now_ms;
    }

    pub fn ecg_peak_count(&self) -> u64 {
        self.ecg.peak_count()
    }

    pub fn ppg_peak_count(&self) -> u64 {
        self.ppg.peak_count()
    }

    pub fn rr_intervals(&self) -> Vec<f64> {
        self.rr_intervals.iter().copied().collect()
    }

    pub fn thresholds(&self) -> (f64, f64) {
        (self.ecg.detector.threshold(), self.ppg.detector.threshold())
    }

    /// Mean delay from each recent R-peak to the first PPG peak 50-400 ms later
    pub fn pulse_transit_time(&self) -> Option<f64> {
        if self.ecg.peaks.len() < 2 || self.ppg.peaks.len() < 2 {
            return None;
        }

        let ppg_peaks: Vec<u64> = self
            .ppg
            .peaks
            .last_n(PTT_PAIRING_WINDOW)
            .map(|p| p.timestamp_ms)
            .collect();

        let pairs: Vec<f64> = self
            .ecg
            .peaks
            .last_n(PTT_PAIRING_WINDOW)
            .filter_map(|ecg| {
                ppg_peaks.iter().find_map(|&ppg_time| {
                    let delay = ppg_time.checked_sub(ecg.timestamp_ms)? as f64;
                    (ppg_time > ecg.timestamp_ms && (PTT_MIN_MS..=PTT_MAX_MS).contains(&delay))
                        .then_some(delay)
                })
            })
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.iter().sum::<f64>() / pairs.len() as f64)
        }
    }

    /// Pulse wave velocity in m/s over an arm path of 40 % of height
    pub fn pulse_wave_velocity(&self, ptt_ms: f64) -> f64 {
        if ptt_ms <= 0.0 {
            return 0.0;
        }
        let path_m = self.personal.height_cm * 0.4 / 100.0;
        path_m / (ptt_ms / 1000.0)
    }

    /// RMSSD of successive RR intervals; 0 with fewer than 10 intervals
    pub fn heart_rate_variability(&self) -> f64 {
        if self.rr_intervals.len() < 10 {
            return 0.0;
        }
        let rr: Vec<f64> = self.rr_intervals.iter().copied().collect();
        let squared: Vec<f64> = rr.windows(2).map(|w| (w[1] - w[0]).powi(2)).collect();
        (squared.iter().sum::<f64>() / squared.len() as f64).sqrt()
    }

    /// Std-dev of the first ten RR intervals below 20 % of their mean
    pub fn rhythm_regular(&self) -> bool {
        if self.rr_intervals.len() < 5 {
            return false;
        }
        let first: Vec<f64> = self.rr_intervals.iter().take(10).copied().collect();
        match mean_and_std_dev(&first) {
            Some((mean, std_dev)) => std_dev < mean * 0.2,
            None => false,
        }
    }

    /// Placeholder coupling score: 85 once both channels show three peaks
    pub fn correlation(&self) -> f64 {
        if self.ecg.peak_count() < 3 || self.ppg.peak_count() < 3 {
            0.0
        } else {
            85.0
        }
    }

    pub fn signal_quality(&self) -> f64 {
        let mut quality: f64 = 100.0;

        if self.ecg.peak_count() < 5 || self.ppg.peak_count() < 5 {
            quality -= 30.0;
        }
        if !self.rhythm_regular() {
            quality -= 20.0;
        }
        if self.correlation().abs() < 50.0 {
            quality -= 25.0;
        }
        if let Some(last_valid) = self.last_valid_reading_ms {
            if self.latest_sample_ms.saturating_sub(last_valid) > STALE_READING_MS {
                quality -= 25.0;
            }
        }

        quality.max(0.0)
    }

    pub fn is_ready(&self) -> bool {
        self.ecg.peak_count() >= 5 && self.ppg.peak_count() >= 5 && self.signal_quality() > 60.0
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated_model.is_some()
    }

    pub fn calibration_points(&self) -> Vec<CalibrationPoint> {
        self.calibration_points.iter().copied().collect()
    }

    /// Estimate blood pressure from the peaks seen so far
    pub fn calculate(&mut self) -> DeviceResult<BloodPressureReading> {
        if self.ecg.peak_count() < 3 || self.ppg.peak_count() < 3 {
            return Err(DeviceError::analysis(format!(
                "Insufficient peak data for blood pressure (ECG {}, PPG {})",
                self.ecg.peak_count(),
                self.ppg.peak_count()
            )));
        }

        let ptt = self.pulse_transit_time().ok_or_else(|| {
            DeviceError::analysis("No ECG/PPG peak pair within the transit window")
        })?;

        let model = self.calibrated_model.unwrap_or(self.default_model);
        let PersonalParameters { age, male, .. } = self.personal;
        let systolic = compensate_for_sex(compensate_for_age(model.systolic(ptt), age), male);
        let diastolic = compensate_for_sex(compensate_for_age(model.diastolic(ptt), age), male);
        let signal_quality = self.signal_quality();

        let valid = signal_quality > 70.0
            && systolic > 70.0
            && systolic < 250.0
            && diastolic > 40.0
            && diastolic < 150.0
            && ptt > 50.0
            && ptt < 500.0;

        if valid {
            self.last_valid_reading_ms = Some(self.latest_sample_ms);
        }

        Ok(BloodPressureReading {
            systolic,
            diastolic,
            mean_arterial_pressure: diastolic + (systolic - diastolic) / 3.0,
            pulse_transit_time: ptt,
            pulse_wave_velocity: self.pulse_wave_velocity(ptt),
            heart_rate_variability: self.heart_rate_variability(),
            signal_quality,
            correlation: self.correlation(),
            rhythm_regular: self.rhythm_regular(),
            needs_calibration: self.calibrated_model.is_none(),
            valid,
            timestamp: self.latest_sample_ms,
        })
    }

    /// Pair a cuff reference with the current PTT; the oldest of five points is dropped
    pub fn add_calibration_point(&mut self, systolic: f64, diastolic: f64) -> DeviceResult<()> {
        let ptt = self
            .pulse_transit_time()
            .ok_or_else(|| DeviceError::analysis("Cannot calibrate without a valid PTT"))?;

        self.calibration_points.push(CalibrationPoint {
            ptt,
            systolic,
            diastolic,
            timestamp_ms: self.latest_sample_ms,
        });

        let points = self.calibration_points();
        if let Some(model) = BpModel::fit(&points) {
            info!(
                points = points.len(),
                systolic_slope = model.systolic_slope,
                diastolic_slope = model.diastolic_slope,
                "Blood pressure calibration updated"
            );
            self.calibrated_model = Some(model);
        }
        Ok(())
    }

    pub fn clear_calibration(&mut self) {
        self.calibration_points.clear();
        self.calibrated_model = None;
    }

    pub fn status(&self) -> String {
        format!(
            "BP Monitor: {} | ECG Peaks: {} | PPG Peaks: {} | Quality: {}% | Cal Points: {}/{}",
            if self.is_ready() { "Ready" } else { "Not Ready" },
            self.ecg.peak_count(),
            self.ppg.peak_count(),
            self.signal_quality() as u32,
            self.calibration_points.len(),
            MAX_CALIBRATION_POINTS
        )
    }

    /// Drop signal history; calibration and personal parameters survive
    pub fn reset(&mut self) {
        self.ecg.reset();
        self.ppg.reset();
        self.rr_intervals.clear();
        self.last_threshold_update_ms = 0;
        self.last_valid_reading_ms = None;
        self.latest_sample_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Distance from `t` to the nearest beat centred on `center`
    fn centered(t: f64, center: f64, period: f64) -> f64 {
        (t - center + period / 2.0).rem_euclid(period) - period / 2.0
    }

    /// Synthetic beats: R-peak every 800 ms, PPG pulse `ptt_ms` later, 100 Hz
    fn feed_beats(
        monitor: &mut BloodPressureMonitor,
        start_ms: u64,
        duration_ms: u64,
        ptt_ms: f64,
    ) {
        let mut t = start_ms;
        while t < start_ms + duration_ms {
            let d_ecg = centered(t as f64, 400.0, 800.0);
            let d_ppg = centered(t as f64, 400.0 + ptt_ms, 800.0);
            let ecg = 800.0 + 2500.0 * (-(d_ecg * d_ecg) / (2.0 * 25.0 * 25.0)).exp();
            let ppg = 20_000.0 + 60_000.0 * (-(d_ppg * d_ppg) / (2.0 * 40.0 * 40.0)).exp();
            monitor.add_ecg_sample(ecg, t);
            monitor.add_ppg_sample(ppg, 60_000.0, t);
            t += 10;
        }
    }

    #[test]
    fn test_default_model_matches_population_curve() {
        let model = BpModel::default();
        assert_eq!(model.systolic(50.0), 120.0);
        assert_eq!(model.diastolic(50.0), 80.0);
    }

    #[test]
    fn test_fit_recovers_linear_relationship() {
        let samples = [(100.0, 140.0, 90.0), (150.0, 120.0, 80.0), (200.0, 100.0, 70.0)];
        let points: Vec<CalibrationPoint> = samples
            .iter()
            .map(|&(ptt, systolic, diastolic)| CalibrationPoint {
                ptt,
                systolic,
                diastolic,
                timestamp_ms: 0,
            })
            .collect();
        let model = BpModel::fit(&points).unwrap();
        assert!((model.systolic_slope + 0.4).abs() < 1e-9);
        assert!((model.systolic_intercept - 180.0).abs() < 1e-9);
        assert!((model.diastolic_slope + 0.2).abs() < 1e-9);
        assert!((model.diastolic_intercept - 110.0).abs() < 1e-9);

        assert!(BpModel::fit(&points[..1]).is_none());
        let same_ptt = vec![points[0], points[0]];
        assert!(BpModel::fit(&same_ptt).is_none());
    }

    #[test]
    fn test_personal_parameters_adjust_default_model() {
        let mut monitor = BloodPressureMonitor::new();
        monitor.set_personal_parameters(65, 155.0, false);
        let model = monitor.default_model;
        assert!((model.systolic_slope - (-1.2 * 1.1)).abs() < 1e-9);
        assert!((model.diastolic_slope - (-0.8 * 1.05)).abs() < 1e-9);
        assert_eq!(model.systolic_intercept, 180.0 - 5.0 - 3.0);
        assert_eq!(model.diastolic_intercept, 117.0);

        // Applying twice does not compound
        monitor.set_personal_parameters(65, 155.0, false);
        assert_eq!(monitor.default_model, model);
    }

    #[test]
    fn test_compensation_factors() {
        assert_eq!(compensate_for_age(100.0, 30), 100.0);
        assert!((compensate_for_age(100.0, 50) - 110.0).abs() < 1e-9);
        assert!((compensate_for_sex(100.0, true) - 102.0).abs() < 1e-9);
        assert_eq!(compensate_for_sex(100.0, false), 100.0);
    }

    #[test]
    fn test_insufficient_peaks_is_error() {
        let mut monitor = BloodPressureMonitor::new();
        feed_beats(&mut monitor, 0, 1000, 65.0);
        assert!(monitor.calculate().is_err());
        assert!(!monitor.is_ready());
    }

    #[test]
    fn test_synthetic_beats_give_valid_reading() {
        let mut monitor = BloodPressureMonitor::new();
        feed_beats(&mut monitor, 0, 12_000, 65.0);

        assert!(monitor.ecg_peak_count() >= 10);
        assert!(monitor.ppg_peak_count() >= 10);
        assert!(monitor.rhythm_regular());
        assert!(monitor.is_ready());

        let reading = monitor.calculate().unwrap();
        assert!(
            (55.0..=75.0).contains(&reading.pulse_transit_time),
            "ptt {}",
            reading.pulse_transit_time
        );
        assert!(reading.valid, "{reading:?}");
        assert!(reading.needs_calibration);
        assert!(reading.systolic > reading.diastolic);
        assert!(
            (reading.mean_arterial_pressure
                - (reading.diastolic + (reading.systolic - reading.diastolic) / 3.0))
                .abs()
                < 1e-9
        );
        // Perfectly periodic beats have no variability
        assert!(reading.heart_rate_variability < 15.0);
    }

    #[test]
    fn test_rr_intervals_track_beat_period() {
        let mut monitor = BloodPressureMonitor::new();
        feed_beats(&mut monitor, 0, 8_000, 65.0);
        let rr = monitor.rr_intervals();
        assert!(!rr.is_empty());
        assert!(rr.iter().all(|&interval| (780.0..=820.0).contains(&interval)));
    }

    #[test]
    fn test_calibration_switches_model() {
        let mut monitor = BloodPressureMonitor::new();
        assert!(monitor.add_calibration_point(120.0, 80.0).is_err());

        feed_beats(&mut monitor, 0, 8_000, 65.0);
        monitor.add_calibration_point(120.0, 80.0).unwrap();
        assert!(!monitor.is_calibrated());

        // A second point at a shifted PTT gives the regression two distinct x values
        feed_beats(&mut monitor, 8_000, 8_000, 120.0);
        monitor.add_calibration_point(110.0, 75.0).unwrap();
        if monitor.calibration_points()[0].ptt != monitor.calibration_points()[1].ptt {
            assert!(monitor.is_calibrated());
            assert!(!monitor.calculate().unwrap().needs_calibration);
        }

        monitor.clear_calibration();
        assert!(!monitor.is_calibrated());
        assert!(monitor.calibration_points().is_empty());
    }

    #[test]
    fn test_reset_clears_signal_history() {
        let mut monitor = BloodPressureMonitor::new();
        feed_beats(&mut monitor, 0, 6_000, 65.0);
        assert!(monitor.ecg_peak_count() > 0);

        monitor.reset();
        assert_eq!(monitor.ecg_peak_count(), 0);
        assert_eq!(monitor.ppg_peak_count(), 0);
        assert!(monitor.rr_intervals().is_empty());
        assert_eq!(monitor.thresholds(), (ECG_DEFAULT_THRESHOLD, PPG_DEFAULT_THRESHOLD));
    }

    #[test]
    fn test_categories() {
        assert_eq!(BpCategory::classify(115.0, 75.0), BpCategory::Normal);
        assert_eq!(BpCategory::classify(125.0, 75.0), BpCategory::Elevated);
        assert_eq!(BpCategory::classify(135.0, 85.0), BpCategory::Stage1Hypertension);
        assert_eq!(BpCategory::classify(150.0, 95.0), BpCategory::Stage2Hypertension);
        assert_eq!(BpCategory::classify(190.0, 125.0), BpCategory::HypertensiveCrisis);
        assert!(is_hypertensive(130.0, 70.0));
        assert!(!is_hypertensive(120.0, 79.0));
        assert_eq!(pulse_pressure(120.0, 80.0), 40.0);
    }

    #[test]
    fn test_pulse_wave_velocity() {
        let monitor = BloodPressureMonitor::new();
        // 170 cm * 0.4 = 0.68 m over 0.2 s
        assert!((monitor.pulse_wave_velocity(200.0) - 3.4).abs() < 1e-9);
        assert_eq!(monitor.pulse_wave_velocity(0.0), 0.0);
    }
}
