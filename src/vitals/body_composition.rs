//! Body composition from multi-frequency bio-impedance (BIA)

use crate::config::{Sex, UserProfile};
use crate::error::{DeviceError, DeviceResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const MIN_VALID_RESISTANCE: f64 = 200.0;
pub const MAX_VALID_RESISTANCE: f64 = 1000.0;
pub const MIN_VALID_REACTANCE: f64 = 10.0;
pub const MAX_VALID_REACTANCE: f64 = 200.0;
pub const MIN_PHASE_ANGLE: f64 = 2.0;
pub const MAX_PHASE_ANGLE: f64 = 20.0;

/// Reference frequency for the primary measurement
const TARGET_FREQUENCY_HZ: f64 = 50_000.0;

/// One impedance measurement at a single excitation frequency
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiaMeasurement {
    pub frequency_hz: f64,
    pub resistance: f64,
    pub reactance: f64,
    pub magnitude: f64,
    /// Degrees
    pub phase: f64,
}

impl BiaMeasurement {
    pub fn new(resistance: f64, reactance: f64, frequency_hz: f64) -> Self {
        Self {
            frequency_hz,
            resistance,
            reactance,
            magnitude: (resistance * resistance + reactance * reactance).sqrt(),
            phase: reactance.atan2(resistance).to_degrees(),
        }
    }

    pub fn phase_angle(&self) -> f64 {
        phase_angle(self.resistance, self.reactance)
    }

    pub fn is_valid(&self) -> bool {
        let phase = self.phase_angle();
        (MIN_VALID_RESISTANCE..=MAX_VALID_RESISTANCE).contains(&self.resistance)
            && (MIN_VALID_REACTANCE..=MAX_VALID_REACTANCE).contains(&self.reactance.abs())
            && (MIN_PHASE_ANGLE..=MAX_PHASE_ANGLE).contains(&phase)
    }
}

/// atan(X/R) in degrees; 0 for a non-positive resistance
pub fn phase_angle(resistance: f64, reactance: f64) -> f64 {
    if resistance <= 0.0 {
        return 0.0;
    }
    (reactance / resistance).atan().to_degrees()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BodyComposition {
    pub body_fat_percentage: f64,
    pub fat_mass_kg: f64,
    pub fat_free_mass_kg: f64,
    pub muscle_mass_kg: f64,
    pub muscle_mass_percentage: f64,
    pub total_body_water_kg: f64,
    pub body_water_percentage: f64,
    pub bone_mass_kg: f64,
    pub visceral_fat_level: f64,
    pub bmr_kcal: f64,
    pub metabolic_age: f64,
    pub phase_angle: f64,
    pub resistance_50khz: f64,
    pub reactance_50khz: f64,
    pub impedance_50khz: f64,
    pub quality_score: f64,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BmiCategory {
    Underweight,
    Normal,
    Overweight,
    ObeseClass1,
    ObeseClass2,
    ObeseClass3,
}

impl BmiCategory {
    pub fn from_bmi(bmi: f64) -> Self {
        match bmi {
            b if b < 18.5 => BmiCategory::Underweight,
            b if b < 25.0 => BmiCategory::Normal,
            b if b < 30.0 => BmiCategory::Overweight,
            b if b < 35.0 => BmiCategory::ObeseClass1,
            b if b < 40.0 => BmiCategory::ObeseClass2,
            _ => BmiCategory::ObeseClass3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFatCategory {
    Essential,
    Athletic,
    Fitness,
    Average,
    AboveAverage,
    Obese,
}

impl BodyFatCategory {
    pub fn classify(body_fat_percentage: f64, sex: Sex) -> Self {
        let cutoffs: [f64; 5] = match sex {
            Sex::Male => [6.0, 14.0, 18.0, 25.0, 30.0],
            Sex::Female => [14.0, 21.0, 25.0, 32.0, 38.0],
        };
        let categories = [
            BodyFatCategory::Essential,
            BodyFatCategory::Athletic,
            BodyFatCategory::Fitness,
            BodyFatCategory::Average,
            BodyFatCategory::AboveAverage,
        ];
        cutoffs
            .iter()
            .zip(categories)
            .find(|(cutoff, _)| body_fat_percentage < **cutoff)
            .map(|(_, category)| category)
            .unwrap_or(BodyFatCategory::Obese)
    }
}

/// Healthy ranges by age band and sex
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRanges {
    pub body_fat_min: f64,
    pub body_fat_max: f64,
    pub muscle_mass_min: f64,
    pub muscle_mass_max: f64,
    pub water_min: f64,
    pub water_max: f64,
}

pub fn reference_ranges(age: u32, sex: Sex) -> ReferenceRanges {
    let r = |v: [f64; 6]| ReferenceRanges {
        body_fat_min: v[0],
        body_fat_max: v[1],
        muscle_mass_min: v[2],
        muscle_mass_max: v[3],
        water_min: v[4],
        water_max: v[5],
    };
    match (sex, age) {
        (Sex::Male, a) if a < 30 => r([8.0, 20.0, 38.0, 52.0, 55.0, 65.0]),
        (Sex::Male, a) if a < 50 => r([11.0, 23.0, 35.0, 49.0, 52.0, 62.0]),
        (Sex::Male, _) => r([13.0, 25.0, 32.0, 46.0, 50.0, 60.0]),
        (Sex::Female, a) if a < 30 => r([16.0, 30.0, 32.0, 45.0, 50.0, 60.0]),
        (Sex::Female, a) if a < 50 => r([19.0, 33.0, 30.0, 43.0, 48.0, 58.0]),
        (Sex::Female, _) => r([22.0, 35.0, 28.0, 40.0, 45.0, 55.0]),
    }
}

pub fn interpret_phase_angle(phase_angle: f64) -> &'static str {
    if phase_angle >= 7.0 {
        "Excellent cellular health"
    } else if phase_angle >= 5.5 {
        "Good cellular health"
    } else if phase_angle >= 4.0 {
        "Average cellular health"
    } else {
        "Below average cellular health"
    }
}

pub fn bmi(weight_kg: f64, height_cm: f64) -> f64 {
    let height_m = height_cm / 100.0;
    weight_kg / (height_m * height_m)
}

/// BIA analyser for one user profile
#[derive(Debug, Clone)]
pub struct BodyCompositionAnalyzer {
    profile: UserProfile,
}

impl BodyCompositionAnalyzer {
    pub fn new(profile: UserProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn set_profile(&mut self, profile: UserProfile) {
        self.profile = profile;
    }

    fn is_male(&self) -> bool {
        self.profile.sex.is_male()
    }

    fn age(&self) -> f64 {
        self.profile.age as f64
    }

    /// Analyse a frequency sweep; `current_weight` replaces the profile weight when positive
    pub fn analyze(
        &self,
        measurements: &[BiaMeasurement],
        current_weight: Option<f64>,
    ) -> DeviceResult<BodyComposition> {
        if measurements.is_empty() {
            return Err(DeviceError::analysis("No BIA measurements to analyse"));
        }

        let primary = measurements
            .iter()
            .filter(|m| m.is_valid())
            .min_by(|a, b| {
                let da = (a.frequency_hz - TARGET_FREQUENCY_HZ).abs();
                let db = (b.frequency_hz - TARGET_FREQUENCY_HZ).abs();
                da.total_cmp(&db)
            })
            .ok_or_else(|| DeviceError::analysis("No valid BIA measurement in sweep"))?;

        let weight = current_weight
            .filter(|w| *w > 0.0)
            .unwrap_or(self.profile.weight_kg);

        let tbw = self.total_body_water(primary.resistance, weight);
        let ffm = self.fat_free_mass(tbw);
        let fat_mass = Self::fat_mass(weight, ffm);
        let body_fat_percentage = fat_mass / weight * 100.0;
        let bone_mass = self.bone_mass(weight);
        let muscle_mass = Self::muscle_mass(ffm, bone_mass, weight);
        let muscle_mass_percentage = muscle_mass / weight * 100.0;
        let bmr = self.bmr(weight, muscle_mass);
        let quality = Self::measurement_quality(measurements);

        let valid = quality > 60.0
            && self.is_reasonable_body_fat(body_fat_percentage)
            && self.is_reasonable_muscle_mass(muscle_mass_percentage);

        debug!(
            body_fat = body_fat_percentage,
            muscle_kg = muscle_mass,
            quality = quality,
            valid = valid,
            "Body composition analysed"
        );

        Ok(BodyComposition {
            body_fat_percentage,
            fat_mass_kg: fat_mass,
            fat_free_mass_kg: ffm,
            muscle_mass_kg: muscle_mass,
            muscle_mass_percentage,
            total_body_water_kg: tbw,
            body_water_percentage: tbw / weight * 100.0,
            bone_mass_kg: bone_mass,
            visceral_fat_level: self.visceral_fat(body_fat_percentage),
            bmr_kcal: bmr,
            metabolic_age: self.metabolic_age(bmr),
            phase_angle: primary.phase_angle(),
            resistance_50khz: primary.resistance,
            reactance_50khz: primary.reactance,
            impedance_50khz: primary.magnitude,
            quality_score: quality,
            valid,
        })
    }

    pub fn analyze_single_frequency(
        &self,
        resistance: f64,
        reactance: f64,
        frequency_hz: f64,
        weight: Option<f64>,
    ) -> DeviceResult<BodyComposition> {
        self.analyze(
            &[BiaMeasurement::new(resistance, reactance, frequency_hz)],
            weight,
        )
    }

    /// Kushner equation with height in cm and resistance in ohms
    pub fn total_body_water(&self, resistance: f64, weight: f64) -> f64 {
        let h2_over_r = self.profile.height_cm.powi(2) / resistance;
        let mut tbw = if self.is_male() {
            0.396 * h2_over_r + 0.143 * weight + 8.399
        } else {
            0.372 * h2_over_r + 0.096 * weight + 4.649
        };

        if self.profile.age > 30 {
            tbw *= 1.0 - (self.age() - 30.0) * 0.02;
        }
        if self.profile.athlete {
            tbw *= 1.05;
        }
        tbw
    }

    pub fn fat_free_mass(&self, total_body_water: f64) -> f64 {
        let hydration = match self.profile.age {
            a if a > 60 => 0.715,
            a if a < 18 => 0.750,
            _ => 0.732,
        };
        total_body_water / hydration
    }

    pub fn fat_mass(weight: f64, fat_free_mass: f64) -> f64 {
        (weight - fat_free_mass).clamp(0.0, weight * 0.6)
    }

    pub fn bone_mass(&self, weight: f64) -> f64 {
        let base = if self.is_male() {
            0.244 * weight + 7.8
        } else {
            0.245 * weight + 5.4
        };
        let mut bone = base * (self.profile.height_cm / 170.0);
        if self.profile.age > 30 {
            bone *= 1.0 - (self.age() - 30.0) * 0.005;
        }
        bone
    }

    /// Fat-free mass less bone and an 8 % organ allowance
    pub fn muscle_mass(fat_free_mass: f64, bone_mass: f64, weight: f64) -> f64 {
        (fat_free_mass - bone_mass - weight * 0.08).clamp(weight * 0.25, weight * 0.55)
    }

    /// Mifflin-St Jeor scaled by muscle ratio
    pub fn bmr(&self, weight: f64, muscle_mass: f64) -> f64 {
        let base = 10.0 * weight + 6.25 * self.profile.height_cm - 5.0 * self.age();
        let (bmr, average_ratio) = if self.is_male() {
            (base + 5.0, 0.45)
        } else {
            (base - 161.0, 0.36)
        };
        let muscle_factor = (muscle_mass / weight) / average_ratio;
        bmr * (0.85 + 0.3 * muscle_factor)
    }

    pub fn visceral_fat(&self, body_fat_percentage: f64) -> f64 {
        let bf = body_fat_percentage;
        let base = if bf < 10.0 {
            1.0
        } else if bf < 15.0 {
            2.0 + (bf - 10.0) * 0.3
        } else if bf < 25.0 {
            3.5 + (bf - 15.0) * 0.4
        } else if bf < 35.0 {
            7.5 + (bf - 25.0) * 0.6
        } else {
            13.5 + (bf - 35.0) * 0.8
        };
        let sex_factor = if self.is_male() { 1.2 } else { 0.8 };
        let age_factor = ((self.age() - 20.0) * 0.05).max(0.0);
        (base * sex_factor + age_factor).clamp(1.0, 30.0)
    }

    fn average_bmr_for_age(&self) -> f64 {
        let table: [f64; 6] = if self.is_male() {
            [1800.0, 1750.0, 1700.0, 1650.0, 1600.0, 1550.0]
        } else {
            [1400.0, 1350.0, 1300.0, 1250.0, 1200.0, 1150.0]
        };
        let band = [25, 35, 45, 55, 65]
            .iter()
            .position(|&cutoff| self.profile.age < cutoff)
            .unwrap_or(5);
        table[band]
    }

    pub fn metabolic_age(&self, bmr: f64) -> f64 {
        let age = self.age();
        if bmr <= 0.0 {
            return age;
        }
        let estimate = age / (bmr / self.average_bmr_for_age());
        let min_age = (age - 15.0).max(18.0);
        let max_age = (age + 15.0).min(80.0);
        if min_age > max_age {
            return age;
        }
        estimate.clamp(min_age, max_age)
    }

    /// 100 less penalties for sweep inconsistency and out-of-band phase angles
    pub fn measurement_quality(measurements: &[BiaMeasurement]) -> f64 {
        if measurements.is_empty() {
            return 0.0;
        }

        let mut quality: f64 = 100.0;
        let count = measurements.len() as f64;

        if measurements.len() > 1 {
            let (dr, dx) = measurements.windows(2).fold((0.0, 0.0), |(dr, dx), w| {
                (
                    dr + (w[1].resistance - w[0].resistance).abs(),
                    dx + (w[1].reactance - w[0].reactance).abs(),
                )
            });
            if dr / count > 20.0 {
                quality -= 30.0;
            }
            if dx / count > 10.0 {
                quality -= 20.0;
            }
        }

        for m in measurements {
            let phase = m.phase_angle();
            if !(3.0..=15.0).contains(&phase) {
                quality -= 15.0;
            }
        }

        quality.max(0.0)
    }

    pub fn is_reasonable_body_fat(&self, body_fat_percentage: f64) -> bool {
        let (min, max) = match (self.profile.sex, self.profile.age) {
            (Sex::Male, a) if a < 30 => (8.0, 25.0),
            (Sex::Male, a) if a < 50 => (11.0, 28.0),
            (Sex::Male, _) => (13.0, 32.0),
            (Sex::Female, a) if a < 30 => (16.0, 35.0),
            (Sex::Female, a) if a < 50 => (19.0, 38.0),
            (Sex::Female, _) => (22.0, 42.0),
        };
        (min..=max).contains(&body_fat_percentage)
    }

    pub fn is_reasonable_muscle_mass(&self, muscle_mass_percentage: f64) -> bool {
        let (mut min, mut max) = if self.is_male() {
            (35.0, 55.0)
        } else {
            (28.0, 48.0)
        };
        if self.profile.age > 50 {
            min -= 5.0;
            max -= 3.0;
        }
        (min..=max).contains(&muscle_mass_percentage)
    }

    pub fn bmi_category(&self, weight: f64) -> BmiCategory {
        BmiCategory::from_bmi(bmi(weight, self.profile.height_cm))
    }
}
