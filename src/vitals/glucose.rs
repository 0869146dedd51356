//! Optical glucose estimate from IR/red absorption

use crate::vitals::signal::RingBuffer;
use serde::{Deserialize, Serialize};

pub const GLUCOSE_WINDOW_SIZE: usize = 10;
pub const MIN_SIGNAL: f64 = 10_000.0;
pub const MAX_SIGNAL: f64 = 150_000.0;
/// Largest step between consecutive IR samples, in percent, for a stable window
const STABILITY_THRESHOLD_PERCENT: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct OpticalSample {
    ir: f64,
    red: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseEstimate {
    /// mg/dL
    pub level: f64,
    pub avg_ir: f64,
    pub avg_red: f64,
    pub ratio: f64,
    pub signal_quality: f64,
    pub stable: bool,
    pub valid: bool,
}

/// Why a sample was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRejection {
    TooWeak,
    Saturated,
}

#[derive(Debug, Clone)]
pub struct GlucoseEstimator {
    window: RingBuffer<OpticalSample>,
}

impl Default for GlucoseEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl GlucoseEstimator {
    pub fn new() -> Self {
        Self {
            window: RingBuffer::new(GLUCOSE_WINDOW_SIZE),
        }
    }

    pub fn add_sample(&mut self, ir: f64, red: f64) -> Result<(), SampleRejection> {
        if ir < MIN_SIGNAL || red < MIN_SIGNAL {
            return Err(SampleRejection::TooWeak);
        }
        if ir > MAX_SIGNAL || red > MAX_SIGNAL {
            return Err(SampleRejection::Saturated);
        }
        self.window.push(OpticalSample { ir, red });
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    /// Regression on averaged absorption
    pub fn glucose_level(avg_ir: f64, avg_red: f64) -> f64 {
        let ratio = if avg_ir > 0.0 { avg_red / avg_ir } else { 0.0 };
        245.2846 - 0.00534 * avg_ir + 0.00312 * avg_red - 82.85 * ratio
    }

    pub fn is_valid_level(level: f64, signal_quality: f64) -> bool {
        (50.0..=500.0).contains(&level) && signal_quality > 30.0
    }

    fn is_stable(&self) -> bool {
        let irs: Vec<f64> = self.window.iter().map(|s| s.ir).collect();
        irs.windows(2)
            .all(|w| ((w[1] - w[0]) / w[0]).abs() * 100.0 < STABILITY_THRESHOLD_PERCENT)
    }

    /// Estimate from a full window; None until ten samples have been accepted
    pub fn estimate(&self) -> Option<GlucoseEstimate> {
        if !self.window.is_full() {
            return None;
        }

        let n = self.window.len() as f64;
        let avg_ir = self.window.iter().map(|s| s.ir).sum::<f64>() / n;
        let avg_red = self.window.iter().map(|s| s.red).sum::<f64>() / n;
        let max_ir = self.window.iter().map(|s| s.ir).fold(f64::MIN, f64::max);
        let min_ir = self.window.iter().map(|s| s.ir).fold(f64::MAX, f64::min);
        let signal_quality = if max_ir > 0.0 {
            (max_ir - min_ir) / max_ir * 100.0
        } else {
            0.0
        };

        let stable = self.is_stable();
        let level = Self::glucose_level(avg_ir, avg_red);

        Some(GlucoseEstimate {
            level,
            avg_ir,
            avg_red,
            ratio: avg_red / avg_ir,
            signal_quality,
            stable,
            valid: stable && Self::is_valid_level(level, signal_quality),
        })
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}
