//! Jet response study: clustered jets against reference jets.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tc_core::{Error, Result, delta_phi};
use tc_data::JetCollection;

use crate::matching::match_jets;

/// Schema version of the JSON study report.
pub const STUDY_SCHEMA_VERSION: &str = "topocal_jet_study_v0";

fn default_max_delta_r() -> f64 {
    0.3
}

fn default_pt_bins() -> Vec<f64> {
    vec![20.0, 40.0, 60.0, 100.0, 200.0, 500.0, 1000.0]
}

/// Matching radius and reference-`pt` binning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    /// Maximum `ΔR` for a match.
    #[serde(default = "default_max_delta_r")]
    pub max_delta_r: f64,
    /// Ascending reference-`pt` bin edges.
    #[serde(default = "default_pt_bins")]
    pub pt_bins: Vec<f64>,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self { max_delta_r: default_max_delta_r(), pt_bins: default_pt_bins() }
    }
}

impl StudyConfig {
    /// Positive radius, at least two strictly ascending finite edges.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_delta_r.is_finite() && self.max_delta_r > 0.0) {
            return Err(Error::Validation(format!(
                "max_delta_r must be > 0, got {}",
                self.max_delta_r
            )));
        }
        if self.pt_bins.len() < 2 {
            return Err(Error::Validation("pt_bins needs at least two edges".into()));
        }
        if self.pt_bins.iter().any(|v| !v.is_finite())
            || self.pt_bins.windows(2).any(|w| w[1] <= w[0])
        {
            return Err(Error::Validation(format!(
                "pt_bins must be finite and strictly ascending: {:?}",
                self.pt_bins
            )));
        }
        Ok(())
    }

    fn bin_of(&self, pt: f64) -> Option<usize> {
        let i = self.pt_bins.partition_point(|&edge| edge <= pt);
        (i >= 1 && i < self.pt_bins.len()).then(|| i - 1)
    }
}

/// Response and resolution in one reference-`pt` bin.
///
/// Statistics are `None` when the bin holds no matched pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBin {
    /// Lower reference-`pt` edge (inclusive).
    pub pt_low: f64,
    /// Upper reference-`pt` edge (exclusive).
    pub pt_high: f64,
    /// Reference jets in the bin.
    pub n_reference: usize,
    /// Matched pairs in the bin.
    pub n_matched: usize,
    /// Median of `pt_jet / pt_ref`.
    pub median_pt_response: Option<f64>,
    /// `(q75 - q25) / (2 * median)` of the `pt` response.
    pub pt_resolution: Option<f64>,
    /// Median of `E_jet / E_ref`.
    pub median_e_response: Option<f64>,
    /// `(q75 - q25) / (2 * median)` of the energy response.
    pub e_resolution: Option<f64>,
    /// Mean of `eta_jet - eta_ref`.
    pub mean_delta_eta: Option<f64>,
    /// RMS of `eta_jet - eta_ref`.
    pub rms_delta_eta: Option<f64>,
    /// Mean of the wrapped `phi_jet - phi_ref`.
    pub mean_delta_phi: Option<f64>,
    /// RMS of the wrapped `phi_jet - phi_ref`.
    pub rms_delta_phi: Option<f64>,
}

/// One clustered collection compared with one reference collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    /// Clustered collection name.
    pub jets: String,
    /// Reference collection name.
    pub reference: String,
    /// Reference jets considered.
    pub n_reference: usize,
    /// Reference jets with a match.
    pub n_matched: usize,
    /// `n_matched / n_reference`, `None` without reference jets.
    pub matched_fraction: Option<f64>,
    /// Per reference-`pt` bin statistics.
    pub bins: Vec<ResponseBin>,
}

/// All comparisons of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyReport {
    /// Always [`STUDY_SCHEMA_VERSION`].
    pub schema_version: String,
    /// Settings used.
    pub config: StudyConfig,
    /// One entry per (clustered, reference) pair.
    pub comparisons: Vec<ComparisonReport>,
}

impl StudyReport {
    /// Write as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[derive(Default)]
struct BinSamples {
    n_reference: usize,
    pt_response: Vec<f64>,
    e_response: Vec<f64>,
    delta_eta: Vec<f64>,
    delta_phi: Vec<f64>,
}

/// Linear-interpolation quantile of sorted values.
fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

fn median_and_resolution(values: &[f64]) -> (Option<f64>, Option<f64>) {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    let median = quantile(&sorted, 0.5);
    let resolution = match (median, quantile(&sorted, 0.25), quantile(&sorted, 0.75)) {
        (Some(m), Some(q25), Some(q75)) if m != 0.0 => Some((q75 - q25) / (2.0 * m)),
        _ => None,
    };
    (median, resolution)
}

fn mean_and_rms(values: &[f64]) -> (Option<f64>, Option<f64>) {
    if values.is_empty() {
        return (None, None);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let rms = (values.iter().map(|v| v * v).sum::<f64>() / n).sqrt();
    (Some(mean), Some(rms))
}

/// Compare one clustered collection with one reference collection.
pub fn compare(
    clustered: &JetCollection,
    reference: &JetCollection,
    cfg: &StudyConfig,
) -> Result<ComparisonReport> {
    cfg.validate()?;
    let n_bins = cfg.pt_bins.len() - 1;
    let mut samples: Vec<BinSamples> = (0..n_bins).map(|_| BinSamples::default()).collect();
    let mut n_reference = 0usize;
    let mut n_matched = 0usize;

    for (ev, refs) in reference.iter() {
        let jets = clustered.jets(ev);
        n_reference += refs.len();
        for r in refs {
            if let Some(b) = cfg.bin_of(r.pt()) {
                samples[b].n_reference += 1;
            }
        }
        for m in match_jets(refs, jets, cfg.max_delta_r) {
            n_matched += 1;
            let (r, j) = (&refs[m.reference], &jets[m.candidate]);
            let Some(b) = cfg.bin_of(r.pt()) else { continue };
            let s = &mut samples[b];
            s.pt_response.push(j.pt() / r.pt());
            s.e_response.push(j.e / r.e);
            s.delta_eta.push(j.eta() - r.eta());
            s.delta_phi.push(delta_phi(j.phi(), r.phi()));
        }
    }

    let bins = samples
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let (median_pt_response, pt_resolution) = median_and_resolution(&s.pt_response);
            let (median_e_response, e_resolution) = median_and_resolution(&s.e_response);
            let (mean_delta_eta, rms_delta_eta) = mean_and_rms(&s.delta_eta);
            let (mean_delta_phi, rms_delta_phi) = mean_and_rms(&s.delta_phi);
            ResponseBin {
                pt_low: cfg.pt_bins[i],
                pt_high: cfg.pt_bins[i + 1],
                n_reference: s.n_reference,
                n_matched: s.pt_response.len(),
                median_pt_response,
                pt_resolution,
                median_e_response,
                e_resolution,
                mean_delta_eta,
                rms_delta_eta,
                mean_delta_phi,
                rms_delta_phi,
            }
        })
        .collect();

    let matched_fraction = (n_reference > 0).then(|| n_matched as f64 / n_reference as f64);
    tracing::info!(
        jets = clustered.name(),
        reference = reference.name(),
        n_reference,
        n_matched,
        "compared jet collections"
    );
    Ok(ComparisonReport {
        jets: clustered.name().to_string(),
        reference: reference.name().to_string(),
        n_reference,
        n_matched,
        matched_fraction,
        bins,
    })
}

/// Compare every clustered collection with every reference collection.
pub fn run_study(
    clustered: &[JetCollection],
    references: &[JetCollection],
    cfg: &StudyConfig,
) -> Result<StudyReport> {
    let mut comparisons = Vec::with_capacity(clustered.len() * references.len());
    for c in clustered {
        for r in references {
            comparisons.push(compare(c, r, cfg)?);
        }
    }
    Ok(StudyReport {
        schema_version: STUDY_SCHEMA_VERSION.to_string(),
        config: cfg.clone(),
        comparisons,
    })
}
