//! Baseline statistics for anomaly detection.
//!
//! Builds per-series baselines (population mean and standard deviation) and
//! answers how far a value sits from its baseline in standard deviations.
//! Series shorter than [`MIN_SAMPLES`] points and series with zero variance
//! produce no baseline at all; that is a skip signal, not an error.

use serde::Serialize;

/// Minimum number of points before any statistical analysis runs.
pub const MIN_SAMPLES: usize = 10;

/// Upper bound on how many trailing points are re-checked against the
/// baseline.
pub const MAX_RECENT_WINDOW: usize = 24;

/// Baseline statistics for one series.
///
/// Uses population formulas (denominator N, not N-1). The baseline is
/// computed over the entire series including the recent points that are
/// later checked against it; that simplification is part of the contract,
/// not an oversight to correct.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Baseline {
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: usize,
}

impl Baseline {
    /// Signed standard deviations of `value` from the baseline mean.
    pub fn z_score(&self, value: f64) -> f64 {
        (value - self.mean) / self.std_dev
    }

    /// Percentage change of `value` relative to the baseline mean, with the
    /// denominator clamped to at least 1 so a zero mean cannot divide by
    /// zero.
    pub fn change_percentage(&self, value: f64) -> f64 {
        (value - self.mean) / self.mean.max(1.0) * 100.0
    }
}

/// Population mean. Returns 0.0 for an empty slice.
pub fn population_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (denominator N).
pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = population_mean(values);
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Compute a baseline over the full series.
///
/// Returns `None` when the series has fewer than [`MIN_SAMPLES`] points or
/// when the standard deviation is exactly zero (a flat series cannot host a
/// z-score anomaly).
pub fn compute_baseline(values: &[f64]) -> Option<Baseline> {
    if values.len() < MIN_SAMPLES {
        return None;
    }
    let std_dev = population_std(values);
    if std_dev == 0.0 {
        return None;
    }
    Some(Baseline {
        mean: population_mean(values),
        std_dev,
        sample_count: values.len(),
    })
}

/// How many trailing points to re-check against the baseline:
/// `min(24, n / 4)`.
pub fn recent_window_len(n: usize) -> usize {
    MAX_RECENT_WINDOW.min(n / 4)
}
