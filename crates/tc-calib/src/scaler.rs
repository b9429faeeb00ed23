//! Fitted per-bin feature scalers.
//!
//! A scaler is a JSON artifact fit offline on training data:
//!
//! ```json
//! {
//!   "bin": "bin0",
//!   "feature_names": ["logE", "abs_eta"],
//!   "transforms": [
//!     { "kind": "standard", "mean": 0.3, "scale": 1.2 },
//!     { "kind": "min_max", "data_min": 0.0, "data_max": 2.5, "feature_range": [0.0, 1.0] }
//!   ]
//! }
//! ```
//!
//! Each transform is invertible, so the same type serves the regression
//! target scalers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tc_core::{ClassLabel, Error, Result};
use tc_data::ClusterTable;

use crate::binning::EnergyBins;

/// One invertible scalar transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureTransform {
    /// `(x - mean) / scale`.
    Standard {
        /// Fitted mean.
        mean: f64,
        /// Fitted standard deviation.
        scale: f64,
    },
    /// Linear map of `[data_min, data_max]` onto `feature_range`.
    MinMax {
        /// Smallest training value.
        data_min: f64,
        /// Largest training value.
        data_max: f64,
        /// Output interval.
        #[serde(default = "default_feature_range")]
        feature_range: [f64; 2],
    },
    /// No-op.
    Identity,
}

fn default_feature_range() -> [f64; 2] {
    [0.0, 1.0]
}

impl FeatureTransform {
    fn validate(&self) -> Result<()> {
        match *self {
            Self::Standard { mean, scale } => {
                if !mean.is_finite() || !scale.is_finite() || scale == 0.0 {
                    return Err(Error::Validation(format!(
                        "standard transform needs finite mean and non-zero scale, got mean={mean} scale={scale}"
                    )));
                }
            }
            Self::MinMax { data_min, data_max, feature_range } => {
                if !(data_min.is_finite() && data_max.is_finite()) || data_max <= data_min {
                    return Err(Error::Validation(format!(
                        "min_max transform needs data_min < data_max, got [{data_min}, {data_max}]"
                    )));
                }
                if !(feature_range[0] < feature_range[1]) {
                    return Err(Error::Validation(format!(
                        "min_max feature_range must be increasing, got {feature_range:?}"
                    )));
                }
            }
            Self::Identity => {}
        }
        Ok(())
    }

    /// Raw value to scaled value.
    #[inline]
    pub fn forward(&self, x: f64) -> f64 {
        match *self {
            Self::Standard { mean, scale } => (x - mean) / scale,
            Self::MinMax { data_min, data_max, feature_range: [lo, hi] } => {
                lo + (x - data_min) * (hi - lo) / (data_max - data_min)
            }
            Self::Identity => x,
        }
    }

    /// Scaled value back to raw value.
    #[inline]
    pub fn inverse(&self, y: f64) -> f64 {
        match *self {
            Self::Standard { mean, scale } => y * scale + mean,
            Self::MinMax { data_min, data_max, feature_range: [lo, hi] } => {
                data_min + (y - lo) * (data_max - data_min) / (hi - lo)
            }
            Self::Identity => y,
        }
    }
}

/// A scaler fit for one energy bin on an ordered feature list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedScaler {
    /// Bin identifier the scaler was fit for.
    pub bin: String,
    /// Ordered feature names used at fit time.
    pub feature_names: Vec<String>,
    /// One transform per feature.
    pub transforms: Vec<FeatureTransform>,
}

impl FittedScaler {
    /// Read and validate a scaler JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Validation(format!("failed to read scaler {}: {e}", path.display()))
        })?;
        let scaler: Self = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Validation(format!("failed to parse scaler {}: {e}", path.display()))
        })?;
        scaler.validate()?;
        Ok(scaler)
    }

    /// Internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.feature_names.is_empty() {
            return Err(Error::Validation(format!("scaler '{}' has no features", self.bin)));
        }
        if self.feature_names.len() != self.transforms.len() {
            return Err(Error::Validation(format!(
                "scaler '{}': {} feature names but {} transforms",
                self.bin,
                self.feature_names.len(),
                self.transforms.len()
            )));
        }
        for t in &self.transforms {
            t.validate()?;
        }
        Ok(())
    }

    /// Fail unless `features` is exactly the fit-time list (names and order).
    pub fn check_features(&self, features: &[String]) -> Result<()> {
        if features != self.feature_names.as_slice() {
            return Err(Error::Consistency(format!(
                "scaler '{}' was fit on {:?} but applied to {:?}",
                self.bin, self.feature_names, features
            )));
        }
        Ok(())
    }

    /// Scale the given rows of each feature column, feature-major.
    pub fn transform_rows(
        &self,
        table: &ClusterTable,
        features: &[String],
        rows: &[usize],
    ) -> Result<Vec<Vec<f64>>> {
        self.check_features(features)?;
        features
            .iter()
            .zip(&self.transforms)
            .map(|(name, t)| -> Result<Vec<f64>> {
                let col = table.require(name)?;
                Ok(rows.iter().map(|&r| t.forward(col[r])).collect())
            })
            .collect()
    }

    /// Invert the transform of feature `index` over a column of values.
    pub fn inverse_column(&self, index: usize, values: &[f64]) -> Result<Vec<f64>> {
        let t = self.transforms.get(index).ok_or_else(|| {
            Error::Validation(format!(
                "scaler '{}' has {} features, no index {index}",
                self.bin,
                self.transforms.len()
            ))
        })?;
        Ok(values.iter().map(|&y| t.inverse(y)).collect())
    }
}

/// How scalers are shared between class labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerSharing {
    /// One scaler list (fit on charged-pion data) applied to both classes.
    #[default]
    Shared,
    /// A separate scaler list per class label.
    PerClass,
}

/// One fitted scaler per energy bin.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalerBank {
    scalers: Vec<FittedScaler>,
}

impl ScalerBank {
    /// Wrap already-loaded scalers.
    pub fn new(scalers: Vec<FittedScaler>) -> Result<Self> {
        for s in &scalers {
            s.validate()?;
        }
        Ok(Self { scalers })
    }

    /// Load one scaler per bin, in bin order.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let scalers = paths.iter().map(|p| FittedScaler::from_path(p)).collect::<Result<_>>()?;
        let bank = Self { scalers };
        tracing::debug!(scalers = bank.len(), "loaded scaler bank");
        Ok(bank)
    }

    /// Number of scalers.
    pub fn len(&self) -> usize {
        self.scalers.len()
    }

    /// `true` when the bank holds no scalers.
    pub fn is_empty(&self) -> bool {
        self.scalers.is_empty()
    }

    /// Scalers in bin order.
    pub fn scalers(&self) -> &[FittedScaler] {
        &self.scalers
    }

    /// Scaler of bin `i`.
    pub fn get(&self, i: usize) -> Result<&FittedScaler> {
        self.scalers.get(i).ok_or_else(|| {
            Error::Consistency(format!("no scaler for bin {i} ({} loaded)", self.scalers.len()))
        })
    }

    /// Exactly one scaler per bin edge.
    pub fn check_bins(&self, bins: &EnergyBins) -> Result<()> {
        if self.scalers.len() != bins.n_bins() {
            return Err(Error::Consistency(format!(
                "{} scalers loaded for {} energy bins",
                self.scalers.len(),
                bins.n_bins()
            )));
        }
        Ok(())
    }

    /// Append `<bin>_<feature>` columns scaled with the scaler of `bin_index`.
    ///
    /// Every row is transformed; row order is preserved. Returns a new table.
    pub fn apply(
        &self,
        bin_index: usize,
        table: &ClusterTable,
        features: &[String],
    ) -> Result<ClusterTable> {
        let scaler = self.get(bin_index)?;
        let rows: Vec<usize> = (0..table.n_rows()).collect();
        let scaled = scaler.transform_rows(table, features, &rows)?;
        let columns = features
            .iter()
            .zip(scaled)
            .map(|(name, values)| (scaled_column_name(&scaler.bin, name), values));
        table.with_columns(columns)
    }
}

/// Name of a scaled feature column.
pub fn scaled_column_name(bin: &str, feature: &str) -> String {
    format!("{bin}_{feature}")
}

/// Input scalers, shared or split by class label.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalerSet {
    /// Same bank for both classes.
    Shared(ScalerBank),
    /// Separate banks.
    PerClass {
        /// Bank for charged-classified regressors.
        charged: ScalerBank,
        /// Bank for neutral-classified regressors.
        neutral: ScalerBank,
    },
}

impl ScalerSet {
    /// Bank used for the regressors of `label`.
    pub fn for_class(&self, label: ClassLabel) -> &ScalerBank {
        match self {
            Self::Shared(bank) => bank,
            Self::PerClass { charged, neutral } => match label {
                ClassLabel::Charged => charged,
                ClassLabel::Neutral => neutral,
            },
        }
    }

    /// Sharing mode.
    pub fn sharing(&self) -> ScalerSharing {
        match self {
            Self::Shared(_) => ScalerSharing::Shared,
            Self::PerClass { .. } => ScalerSharing::PerClass,
        }
    }

    /// Every bank has one scaler per bin.
    pub fn check_bins(&self, bins: &EnergyBins) -> Result<()> {
        match self {
            Self::Shared(bank) => bank.check_bins(bins),
            Self::PerClass { charged, neutral } => {
                charged.check_bins(bins)?;
                neutral.check_bins(bins)
            }
        }
    }
}
