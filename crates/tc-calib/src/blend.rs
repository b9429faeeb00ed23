//! Energy blending by classification score.

use tc_core::{Error, Result};

/// Per-cluster energy chosen by classification score.
///
/// `predicted[i] = charged[i]` when `scores[i] > threshold`, else
/// `neutral[i]`. A score equal to the threshold selects neutral.
pub fn blend(scores: &[f64], threshold: f64, charged: &[f64], neutral: &[f64]) -> Result<Vec<f64>> {
    if scores.len() != charged.len() || scores.len() != neutral.len() {
        return Err(Error::Validation(format!(
            "blend needs equal lengths, got scores={} charged={} neutral={}",
            scores.len(),
            charged.len(),
            neutral.len()
        )));
    }
    Ok(scores
        .iter()
        .zip(charged.iter().zip(neutral))
        .map(|(&s, (&c, &n))| if s > threshold { c } else { n })
        .collect())
}

/// Multiply calibration ratios by reconstructed energies.
pub fn apply_ratio(ratio: &[f64], energy: &[f64]) -> Result<Vec<f64>> {
    if ratio.len() != energy.len() {
        return Err(Error::Validation(format!(
            "{} ratios for {} energies",
            ratio.len(),
            energy.len()
        )));
    }
    Ok(ratio.iter().zip(energy).map(|(r, e)| r * e).collect())
}
