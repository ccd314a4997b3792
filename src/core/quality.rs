//! Multi-factor image quality model.
//!
//! A candidate's score is a weighted sum of six independently normalised
//! sub-scores (cloud, solar geometry, view geometry, valid pixels, temporal
//! position, native resolution) scaled by a band-completeness penalty.
//! Missing optional metadata scores as full credit.

use crate::types::{Band, CandidateImage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cloud penalty slope (steeper than 1:1)
const CLOUD_SLOPE: f64 = 1.5;

/// Resolution step table: (max resolution in metres, score)
const RESOLUTION_STEPS: [(f64, f64); 6] = [
    (4.0, 1.0),
    (15.0, 0.95),
    (30.0, 0.85),
    (60.0, 0.60),
    (250.0, 0.40),
    (400.0, 0.25),
];
const RESOLUTION_FLOOR: f64 = 0.15;

/// Completeness below which the band penalty turns quadratic
const COMPLETENESS_KNEE: f64 = 0.7;

/// Weights of the six sub-scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub resolution: f64,
    pub cloud: f64,
    pub valid_pixels: f64,
    pub solar: f64,
    pub view: f64,
    pub temporal: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            resolution: 0.30,   // Largest fixed weight
            cloud: 0.25,
            valid_pixels: 0.15,
            solar: 0.10,
            view: 0.10,
            temporal: 0.10,
        }
    }
}

impl QualityWeights {
    pub fn total(&self) -> f64 {
        self.resolution + self.cloud + self.valid_pixels + self.solar + self.view + self.temporal
    }

    fn all(&self) -> [f64; 6] {
        [self.resolution, self.cloud, self.valid_pixels, self.solar, self.view, self.temporal]
    }

    pub fn is_valid(&self) -> bool {
        self.all().iter().all(|w| w.is_finite() && *w >= 0.0) && self.total() > 0.0
    }
}

/// Inputs to one score evaluation
#[derive(Debug, Clone, Default)]
pub struct QualityInputs {
    pub cloud_fraction: f64,
    pub solar_zenith_deg: Option<f64>,
    pub view_zenith_deg: Option<f64>,
    pub valid_pixel_fraction: Option<f64>,
    pub days_since_window_start: Option<f64>,
    pub window_length_days: f64,
    pub native_resolution_m: f64,
    pub band_completeness: Option<f64>,
}

/// Individual sub-scores, kept for provenance and debugging
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub resolution: f64,
    pub cloud: f64,
    pub valid_pixels: f64,
    pub solar: f64,
    pub view: f64,
    pub temporal: f64,
    pub band_penalty: f64,
    pub total: f64,
}

/// Quality model
#[derive(Debug, Clone, Default)]
pub struct QualityModel {
    weights: QualityWeights,
}

impl QualityModel {
    pub fn new(weights: QualityWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }

    /// Score in [0, 1]
    pub fn score(&self, inputs: &QualityInputs) -> f64 {
        self.breakdown(inputs).total
    }

    pub fn breakdown(&self, inputs: &QualityInputs) -> ScoreBreakdown {
        let resolution = resolution_score(inputs.native_resolution_m);
        let cloud = cloud_score(inputs.cloud_fraction);
        let valid_pixels = inputs.valid_pixel_fraction.map_or(1.0, valid_pixel_score);
        let solar = inputs.solar_zenith_deg.map_or(1.0, solar_score);
        let view = inputs.view_zenith_deg.map_or(1.0, view_score);
        let temporal = inputs
            .days_since_window_start
            .map_or(1.0, |days| temporal_score(days, inputs.window_length_days));
        let band_penalty = inputs.band_completeness.map_or(1.0, band_penalty);

        let w = &self.weights;
        let weight_sum = w.total();
        let weighted = if weight_sum > 0.0 {
            (w.resolution * resolution
                + w.cloud * cloud
                + w.valid_pixels * valid_pixels
                + w.solar * solar
                + w.view * view
                + w.temporal * temporal)
                / weight_sum
        } else {
            0.0
        };

        let total = (weighted * band_penalty).clamp(0.0, 1.0);
        ScoreBreakdown {
            resolution,
            cloud,
            valid_pixels,
            solar,
            view,
            temporal,
            band_penalty,
            total,
        }
    }

    /// Score a catalog candidate against a date window
    pub fn score_candidate(
        &self,
        candidate: &CandidateImage,
        window_start: DateTime<Utc>,
        window_length_days: f64,
        band_completeness: Option<f64>,
    ) -> f64 {
        let days = (candidate.acquired - window_start).num_seconds() as f64 / 86_400.0;
        let inputs = QualityInputs {
            cloud_fraction: candidate.effective_cloud_fraction(),
            solar_zenith_deg: candidate.solar_zenith_deg,
            view_zenith_deg: candidate.view_zenith_deg,
            valid_pixel_fraction: candidate.valid_pixel_fraction,
            days_since_window_start: Some(days.max(0.0)),
            window_length_days,
            native_resolution_m: candidate.native_resolution_m,
            band_completeness,
        };
        self.score(&inputs)
    }
}

/// Linear cloud penalty, floor 0
pub fn cloud_score(cloud_fraction: f64) -> f64 {
    let cloud = if cloud_fraction.is_finite() { cloud_fraction.clamp(0.0, 1.0) } else { 1.0 };
    (1.0 - CLOUD_SLOPE * cloud).max(0.0)
}

/// Full credit up to 60 deg zenith, then linear decay reaching the 0.2 floor at 80 deg
pub fn solar_score(zenith_deg: f64) -> f64 {
    if !zenith_deg.is_finite() {
        return 1.0;
    }
    let z = zenith_deg.abs();
    if z <= 60.0 {
        1.0
    } else {
        (1.0 - 0.8 * (z - 60.0) / 20.0).max(0.2)
    }
}

/// Full credit within 10 deg of nadir, decays to 0.5 at 40 deg
pub fn view_score(zenith_deg: f64) -> f64 {
    if !zenith_deg.is_finite() {
        return 1.0;
    }
    let z = zenith_deg.abs();
    if z <= 10.0 {
        1.0
    } else {
        (1.0 - 0.5 * (z - 10.0) / 30.0).max(0.5)
    }
}

pub fn valid_pixel_score(fraction: f64) -> f64 {
    if !fraction.is_finite() {
        return 1.0;
    }
    fraction.clamp(0.0, 1.0).max(0.3)
}

/// Linear decay across the window, floor 0.5
pub fn temporal_score(days_since_start: f64, window_length_days: f64) -> f64 {
    if !(window_length_days > 0.0) || !days_since_start.is_finite() {
        return 1.0;
    }
    let position = (days_since_start / window_length_days).clamp(0.0, 1.0);
    (1.0 - 0.5 * position).max(0.5)
}

/// Step function over native resolution
pub fn resolution_score(resolution_m: f64) -> f64 {
    if !resolution_m.is_finite() || resolution_m <= 0.0 {
        return RESOLUTION_FLOOR;
    }
    RESOLUTION_STEPS
        .iter()
        .find(|(limit, _)| resolution_m <= *limit)
        .map_or(RESOLUTION_FLOOR, |(_, score)| *score)
}

/// Completeness of the available standard bands.
///
/// RGB is mandatory; without it completeness stays below 0.5. With RGB the
/// three IR bands add up to 0.3 and the two derivable indices (NDVI, NDWI)
/// up to 0.2.
pub fn band_completeness(available: &[Band]) -> f64 {
    let has = |b: Band| available.contains(&b);
    let rgb = Band::PRIMARY.iter().filter(|b| has(**b)).count();
    if rgb < Band::PRIMARY.len() {
        return 0.5 * rgb as f64 / 3.0;
    }
    let ir = [Band::Nir, Band::Swir1, Band::Swir2].iter().filter(|b| has(**b)).count();
    let ndvi = has(Band::Red) && has(Band::Nir);
    let ndwi = has(Band::Green) && has(Band::Nir);
    let indices = [ndvi, ndwi].iter().filter(|x| **x).count();
    0.5 + 0.3 * ir as f64 / 3.0 + 0.2 * indices as f64 / 2.0
}

/// Non-linear penalty factor, steep below 70% completeness
pub fn band_penalty(completeness: f64) -> f64 {
    let c = if completeness.is_finite() { completeness.clamp(0.0, 1.0) } else { 0.0 };
    if c >= COMPLETENESS_KNEE {
        1.0 - 0.5 * (1.0 - c)
    } else {
        0.85 * (c / COMPLETENESS_KNEE).powi(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn inputs(cloud: f64, resolution: f64) -> QualityInputs {
        QualityInputs {
            cloud_fraction: cloud,
            window_length_days: 30.0,
            native_resolution_m: resolution,
            ..Default::default()
        }
    }

    #[test]
    fn test_score_bounds() {
        let model = QualityModel::default();
        for cloud in [0.0, 0.3, 0.7, 1.0, 5.0, f64::NAN] {
            for res in [0.5, 3.0, 10.0, 30.0, 250.0, 1000.0, -1.0] {
                for completeness in [None, Some(0.0), Some(0.4), Some(1.0)] {
                    let mut i = inputs(cloud, res);
                    i.band_completeness = completeness;
                    i.solar_zenith_deg = Some(85.0);
                    i.view_zenith_deg = Some(60.0);
                    let s = model.score(&i);
                    assert!((0.0..=1.0).contains(&s), "score {} out of range", s);
                }
            }
        }
    }

    #[test]
    fn test_cloud_monotonic() {
        let model = QualityModel::default();
        let mut previous = f64::MAX;
        for step in 0..=20 {
            let s = model.score(&inputs(step as f64 / 20.0, 10.0));
            assert!(s <= previous);
            previous = s;
        }
    }

    #[test]
    fn test_finer_resolution_never_scores_lower() {
        let model = QualityModel::default();
        let resolutions = [1000.0, 400.0, 300.0, 250.0, 100.0, 60.0, 30.0, 20.0, 10.0, 3.0];
        let mut previous = 0.0;
        for res in resolutions {
            let s = model.score(&inputs(0.2, res));
            assert!(s >= previous);
            previous = s;
        }
    }

    #[test]
    fn test_fine_cloudy_outranks_coarse_clear() {
        let model = QualityModel::default();
        let fine = model.score(&inputs(0.05, 10.0));
        let coarse = model.score(&inputs(0.0, 250.0));
        assert_abs_diff_eq!(fine, 0.966, epsilon = 1e-3);
        assert_abs_diff_eq!(coarse, 0.82, epsilon = 1e-3);
        assert!(fine > coarse);
    }

    #[test]
    fn test_sub_scores() {
        assert_abs_diff_eq!(cloud_score(0.5), 0.25, epsilon = 1e-12);
        assert_eq!(cloud_score(0.9), 0.0);
        assert_eq!(solar_score(25.0), 1.0);
        assert_eq!(solar_score(45.0), 1.0);
        assert_eq!(solar_score(60.0), 1.0);
        assert_abs_diff_eq!(solar_score(70.0), 0.6, epsilon = 1e-12);
        assert_eq!(solar_score(89.0), 0.2);
        assert_eq!(view_score(5.0), 1.0);
        assert_abs_diff_eq!(view_score(25.0), 0.75, epsilon = 1e-12);
        assert_eq!(view_score(70.0), 0.5);
        assert_eq!(valid_pixel_score(0.1), 0.3);
        assert_abs_diff_eq!(temporal_score(15.0, 30.0), 0.75, epsilon = 1e-12);
        assert_eq!(temporal_score(40.0, 30.0), 0.5);
        assert_eq!(temporal_score(3.0, 0.0), 1.0);
        assert_eq!(resolution_score(4.0), 1.0);
        assert_eq!(resolution_score(30.0), 0.85);
        assert_eq!(resolution_score(300.0), 0.25);
        assert_eq!(resolution_score(500.0), 0.15);
    }

    #[test]
    fn test_band_completeness_and_penalty() {
        assert_eq!(band_completeness(&Band::STANDARD), 1.0);
        assert_abs_diff_eq!(band_completeness(&Band::PRIMARY), 0.5, epsilon = 1e-12);
        let partial_rgb = band_completeness(&[Band::Red, Band::Green]);
        assert_abs_diff_eq!(partial_rgb, 1.0 / 3.0, epsilon = 1e-12);

        assert_eq!(band_penalty(1.0), 1.0);
        assert_abs_diff_eq!(band_penalty(0.7), 0.85, epsilon = 1e-12);
        assert!(band_penalty(0.5) < 0.5);
        assert_eq!(band_penalty(0.0), 0.0);
    }

    #[test]
    fn test_missing_metadata_is_neutral() {
        let model = QualityModel::default();
        let b = model.breakdown(&inputs(0.0, 3.0));
        assert_eq!(b.total, 1.0);
        assert_eq!(b.band_penalty, 1.0);
    }
}
