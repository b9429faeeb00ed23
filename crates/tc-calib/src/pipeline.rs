//! The calibration pipeline: features, routing, classification, binned
//! regression and blending.
//!
//! Every stage returns a new value; the input sample is never modified.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tc_core::{ClassLabel, Error, Network, Result};
use tc_data::{ClusterBranches, ClusterSample, derive_features, has_log_energy};

use crate::artifacts::CacheTags;
use crate::binning::{BinAssignment, EnergyBins};
use crate::blend::{apply_ratio, blend};
use crate::models::{ArtifactBundle, RegressorModels};
use crate::network::{NetworkLoader, predict_rows};
use crate::score_cache::{ScoreCache, ScoreRecord};

/// Classifier score (charged probability).
pub const CLF_SCORE: &str = "clf_score";
/// Charged-hypothesis calibration ratio.
pub const RATIO_CHARGED: &str = "ratio_charged";
/// Neutral-hypothesis calibration ratio.
pub const RATIO_NEUTRAL: &str = "ratio_neutral";
/// Charged-hypothesis calibrated energy.
pub const ENERGY_CHARGED: &str = "energy_charged";
/// Neutral-hypothesis calibrated energy.
pub const ENERGY_NEUTRAL: &str = "energy_neutral";
/// Blended calibrated energy.
pub const ENERGY_PRED: &str = "energy_pred";

/// Key of the classification score cache.
pub const SCORE_KEY: &str = "score";

/// What happens to clusters below the first bin edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BelowRangePolicy {
    /// Keep them with ratio 1.0 (uncorrected energy).
    #[default]
    PassThrough,
    /// Remove them from the calibrated output.
    Drop,
}

/// Non-artifact pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Regression energy bins.
    pub bins: EnergyBins,
    /// Classification-score threshold; scores above it select the charged regression.
    pub threshold: f64,
    /// Treatment of clusters below the first edge.
    pub below_range: BelowRangePolicy,
    /// Input column names.
    pub branches: ClusterBranches,
}

/// Classification and regression score caches.
#[derive(Debug, Clone)]
pub struct ScoreCaches {
    /// Classifier scores.
    pub classification: ScoreCache,
    /// Per-class regression ratios.
    pub regression: ScoreCache,
}

impl ScoreCaches {
    /// `classification.parquet` and `regression.parquet` under `dir`.
    pub fn in_dir(dir: &Path, tags: &CacheTags) -> Self {
        Self {
            classification: ScoreCache::new(
                dir.join("classification.parquet"),
                tags.classification.clone(),
            ),
            regression: ScoreCache::new(dir.join("regression.parquet"), tags.regression.clone()),
        }
    }
}

/// Result of [`CalibrationPipeline::run`].
#[derive(Debug, Clone)]
pub struct CalibrationOutput {
    /// Input sample plus derived features and calibration columns.
    pub sample: ClusterSample,
    /// Bin assignment of the input rows.
    pub assignment: BinAssignment,
    /// Clusters removed by [`BelowRangePolicy::Drop`].
    pub n_dropped: usize,
}

/// Applies the classifier and binned regressors to cluster samples.
pub struct CalibrationPipeline<'a> {
    bundle: &'a ArtifactBundle,
    settings: PipelineSettings,
    loader: &'a dyn NetworkLoader,
    caches: Option<ScoreCaches>,
}

impl<'a> CalibrationPipeline<'a> {
    /// Pipeline over validated artifacts; networks are loaded with `loader` on demand.
    pub fn new(
        bundle: &'a ArtifactBundle,
        settings: PipelineSettings,
        loader: &'a dyn NetworkLoader,
    ) -> Result<Self> {
        if !settings.threshold.is_finite() {
            return Err(Error::Validation(format!(
                "score threshold must be finite, got {}",
                settings.threshold
            )));
        }
        bundle.scalers().check_bins(&settings.bins)?;
        Ok(Self { bundle, settings, loader, caches: None })
    }

    /// Persist and reuse scores through `caches`.
    pub fn with_caches(mut self, caches: ScoreCaches) -> Self {
        self.caches = Some(caches);
        self
    }

    /// Settings in use.
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Charged-class score for every cluster of a featured sample.
    pub fn classify(&self, sample: &ClusterSample) -> Result<Vec<f64>> {
        let n = sample.n_rows();
        let compute = || -> Result<ScoreRecord> {
            let classifier = self.bundle.load_classifier(self.loader)?;
            let spec = &self.bundle.manifest().classifier;
            let rows: Vec<usize> = (0..n).collect();
            let scalars = spec
                .scalars
                .iter()
                .map(|name| sample.table().require(name).map(<[f64]>::to_vec))
                .collect::<Result<Vec<_>>>()?;
            let scores = predict_rows(classifier.as_ref(), sample, &rows, spec, &scalars)?;
            Ok(ScoreRecord::single(SCORE_KEY, scores))
        };
        let record = match &self.caches {
            Some(c) => c.classification.get_or_compute(&[SCORE_KEY], n, compute)?,
            None => compute()?,
        };
        Ok(record.require(SCORE_KEY)?.to_vec())
    }

    /// Decoded calibration ratios per class label for every routed cluster.
    ///
    /// Unassigned rows hold NaN. Routed clusters without a positive energy
    /// are not regressed and hold 1.0.
    pub fn regress(
        &self,
        sample: &ClusterSample,
        assignment: &BinAssignment,
    ) -> Result<ScoreRecord> {
        let n = sample.n_rows();
        if assignment.n_rows() != n {
            return Err(Error::Validation(format!(
                "bin assignment covers {} rows, sample has {n}",
                assignment.n_rows()
            )));
        }
        let keys = [ClassLabel::Charged.as_str(), ClassLabel::Neutral.as_str()];
        let compute = || -> Result<ScoreRecord> {
            let models = self.bundle.load_regressors(self.loader)?;
            let columns = ClassLabel::ALL
                .iter()
                .map(|&label| -> Result<(String, Vec<f64>)> {
                    let ratios = self.regress_class(sample, assignment, &models, label)?;
                    Ok((label.as_str().to_string(), ratios))
                })
                .collect::<Result<Vec<_>>>()?;
            ScoreRecord::new(columns)
        };
        match &self.caches {
            Some(c) => c.regression.get_or_compute(&keys, n, compute),
            None => compute(),
        }
    }

    fn regress_class(
        &self,
        sample: &ClusterSample,
        assignment: &BinAssignment,
        models: &RegressorModels,
        label: ClassLabel,
    ) -> Result<Vec<f64>> {
        let manifest = self.bundle.manifest();
        let bank = self.bundle.scalers().for_class(label);
        let energy = sample.table().require(&self.settings.branches.energy)?;
        let mut ratios = vec![f64::NAN; sample.n_rows()];

        for (bin, routed) in assignment.per_bin().iter().enumerate() {
            // logE is undefined for E <= 0; those clusters keep ratio 1.0.
            let (rows, undefined): (Vec<usize>, Vec<usize>) =
                routed.iter().copied().partition(|&r| has_log_energy(energy[r]));
            for r in undefined {
                ratios[r] = 1.0;
            }
            if rows.is_empty() {
                continue;
            }
            let spec = &manifest.regressors.for_class(label)[bin];
            let network: &Arc<dyn Network> = models.get(label, bin)?;

            let scalars = if spec.scalars.is_empty() {
                Vec::new()
            } else {
                bank.get(bin)?.transform_rows(sample.table(), &spec.scalars, &rows)?
            };

            let mut predicted = predict_rows(network.as_ref(), sample, &rows, spec, &scalars)?;
            if let Some(targets) = self.bundle.target_scalers() {
                predicted = targets.get(bin)?.inverse_column(0, &predicted)?;
            }
            for (&row, v) in rows.iter().zip(predicted) {
                ratios[row] = manifest.target_encoding.decode(v);
            }
            tracing::debug!(class = %label, bin, rows = rows.len(), "regressed bin");
        }
        Ok(ratios)
    }

    /// Calibrate a sample: derive features, route, classify, regress, blend.
    pub fn run(&self, sample: &ClusterSample) -> Result<CalibrationOutput> {
        let branches = &self.settings.branches;
        let featured = sample.with_table(derive_features(sample.table(), branches)?)?;
        let energy = featured.table().require(&branches.energy)?.to_vec();

        let assignment = self.settings.bins.route(&energy);
        tracing::info!(
            clusters = featured.n_rows(),
            assigned = assignment.n_assigned(),
            below_range = assignment.unassigned().len(),
            "routed clusters to energy bins"
        );

        let scores = self.classify(&featured)?;
        let ratios = self.regress(&featured, &assignment)?;
        let mut ratio_c = ratios.require(ClassLabel::Charged.as_str())?.to_vec();
        let mut ratio_n = ratios.require(ClassLabel::Neutral.as_str())?.to_vec();
        for &row in assignment.unassigned() {
            ratio_c[row] = 1.0;
            ratio_n[row] = 1.0;
        }

        let energy_c = apply_ratio(&ratio_c, &energy)?;
        let energy_n = apply_ratio(&ratio_n, &energy)?;
        let energy_pred = blend(&scores, self.settings.threshold, &energy_c, &energy_n)?;

        let table = featured.table().with_columns([
            (CLF_SCORE.to_string(), scores),
            (RATIO_CHARGED.to_string(), ratio_c),
            (RATIO_NEUTRAL.to_string(), ratio_n),
            (ENERGY_CHARGED.to_string(), energy_c),
            (ENERGY_NEUTRAL.to_string(), energy_n),
            (ENERGY_PRED.to_string(), energy_pred),
        ])?;
        let calibrated = featured.with_table(table)?;

        let (sample, n_dropped) = match self.settings.below_range {
            BelowRangePolicy::PassThrough => (calibrated, 0),
            BelowRangePolicy::Drop => {
                let keep: Vec<usize> = assignment
                    .bin_per_row()
                    .iter()
                    .enumerate()
                    .filter_map(|(row, bin)| bin.map(|_| row))
                    .collect();
                let dropped = calibrated.n_rows() - keep.len();
                (calibrated.take_rows(&keep)?, dropped)
            }
        };
        if n_dropped > 0 {
            tracing::info!(dropped = n_dropped, "dropped clusters below the first energy bin");
        }
        Ok(CalibrationOutput { sample, assignment, n_dropped })
    }
}
