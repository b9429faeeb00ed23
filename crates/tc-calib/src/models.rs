//! Validated model artifacts and network loading.
//!
//! [`ArtifactBundle::open`] runs every consistency check (bin counts, bin
//! identifiers, scaler feature lists) and loads the scalers. Networks are
//! loaded afterwards, only when a score cache misses, in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tc_core::{ClassLabel, Error, LayerSpec, Network, Result};
use tc_data::ClusterBranches;

use crate::artifacts::{ArtifactManifest, CacheTags, NetworkSpec, TagSettings, cache_tags};
use crate::binning::EnergyBins;
use crate::network::NetworkLoader;
use crate::scaler::{ScalerBank, ScalerSet, ScalerSharing};

/// A manifest whose scalers are loaded and whose artifacts are consistent.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    manifest: ArtifactManifest,
    base_dir: PathBuf,
    layers: Vec<LayerSpec>,
    scalers: ScalerSet,
    target_scalers: Option<ScalerBank>,
}

impl ArtifactBundle {
    /// Read the manifest at `path` and validate it.
    pub fn open(
        path: &Path,
        bins: &EnergyBins,
        layers: &[LayerSpec],
        sharing: ScalerSharing,
    ) -> Result<Self> {
        let manifest = ArtifactManifest::from_path(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Self::from_manifest(manifest, base_dir, bins, layers, sharing)
    }

    /// Validate an in-memory manifest whose files live under `base_dir`.
    pub fn from_manifest(
        manifest: ArtifactManifest,
        base_dir: PathBuf,
        bins: &EnergyBins,
        layers: &[LayerSpec],
        sharing: ScalerSharing,
    ) -> Result<Self> {
        manifest.validate(bins, layers, sharing)?;

        let resolve = |files: &[String]| -> Vec<PathBuf> {
            files.iter().map(|f| ArtifactManifest::resolve(&base_dir, f)).collect()
        };
        let scalers = match (sharing, &manifest.scalers_neutral) {
            (ScalerSharing::PerClass, Some(neutral)) => ScalerSet::PerClass {
                charged: ScalerBank::load(&resolve(&manifest.scalers))?,
                neutral: ScalerBank::load(&resolve(neutral))?,
            },
            _ => ScalerSet::Shared(ScalerBank::load(&resolve(&manifest.scalers))?),
        };
        scalers.check_bins(bins)?;
        manifest.check_bin_tags(&scalers)?;

        let target_scalers = match &manifest.target_scalers {
            Some(files) => {
                let bank = ScalerBank::load(&resolve(files))?;
                bank.check_bins(bins)?;
                let inputs = scalers.for_class(ClassLabel::Charged);
                for (i, ts) in bank.scalers().iter().enumerate() {
                    if ts.feature_names.len() != 1 {
                        return Err(Error::Validation(format!(
                            "target scaler for bin {i} must have one feature, has {:?}",
                            ts.feature_names
                        )));
                    }
                    let expected = &inputs.get(i)?.bin;
                    if &ts.bin != expected {
                        return Err(Error::Consistency(format!(
                            "bin {i}: target scaler is fit for '{}' but input scaler for '{expected}'",
                            ts.bin
                        )));
                    }
                }
                Some(bank)
            }
            None => None,
        };

        tracing::info!(
            bins = bins.n_bins(),
            sharing = ?sharing,
            target_scalers = target_scalers.is_some(),
            "model artifacts are consistent"
        );
        Ok(Self { manifest, base_dir, layers: layers.to_vec(), scalers, target_scalers })
    }

    /// The manifest.
    pub fn manifest(&self) -> &ArtifactManifest {
        &self.manifest
    }

    /// Directory artifact paths are relative to.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Input scalers.
    pub fn scalers(&self) -> &ScalerSet {
        &self.scalers
    }

    /// Target scalers, when the regressors predict scaled targets.
    pub fn target_scalers(&self) -> Option<&ScalerBank> {
        self.target_scalers.as_ref()
    }

    /// Content-hash tags for the score caches.
    ///
    /// Mixes in the layer geometry and scaler sharing the bundle was opened with.
    pub fn cache_tags(&self, bins: &EnergyBins, branches: &ClusterBranches) -> Result<CacheTags> {
        let settings = TagSettings {
            bins,
            layers: &self.layers,
            sharing: self.scalers.sharing(),
            branches,
        };
        cache_tags(&self.manifest, &self.base_dir, &settings)
    }

    fn load_specs(
        &self,
        specs: &[&NetworkSpec],
        loader: &dyn NetworkLoader,
    ) -> Result<Vec<Arc<dyn Network>>> {
        specs
            .par_iter()
            .map(|spec| loader.load(&ArtifactManifest::resolve(&self.base_dir, &spec.file), spec))
            .collect()
    }

    /// Load the classifier.
    pub fn load_classifier(&self, loader: &dyn NetworkLoader) -> Result<Arc<dyn Network>> {
        let path = ArtifactManifest::resolve(&self.base_dir, &self.manifest.classifier.file);
        loader.load(&path, &self.manifest.classifier)
    }

    /// Load every regressor, in parallel.
    pub fn load_regressors(&self, loader: &dyn NetworkLoader) -> Result<RegressorModels> {
        let charged: Vec<&NetworkSpec> = self.manifest.regressors.charged.iter().collect();
        let neutral: Vec<&NetworkSpec> = self.manifest.regressors.neutral.iter().collect();
        let n = charged.len();
        let all: Vec<&NetworkSpec> = charged.into_iter().chain(neutral).collect();
        let mut loaded = self.load_specs(&all, loader)?;
        let neutral = loaded.split_off(n);
        tracing::info!(regressors = loaded.len() + neutral.len(), "loaded regressors");
        Ok(RegressorModels { charged: loaded, neutral })
    }

    /// Load the classifier and every regressor, in parallel.
    pub fn load_all(&self, loader: &dyn NetworkLoader) -> Result<ModelSet> {
        let (classifier, regressors) =
            rayon::join(|| self.load_classifier(loader), || self.load_regressors(loader));
        Ok(ModelSet { classifier: classifier?, regressors: regressors? })
    }
}

/// Loaded per-bin regressors.
#[derive(Clone)]
pub struct RegressorModels {
    charged: Vec<Arc<dyn Network>>,
    neutral: Vec<Arc<dyn Network>>,
}

impl RegressorModels {
    /// Wrap already-loaded networks (bin order).
    pub fn new(charged: Vec<Arc<dyn Network>>, neutral: Vec<Arc<dyn Network>>) -> Self {
        Self { charged, neutral }
    }

    /// Regressor of `label` for bin `i`.
    pub fn get(&self, label: ClassLabel, i: usize) -> Result<&Arc<dyn Network>> {
        let list = match label {
            ClassLabel::Charged => &self.charged,
            ClassLabel::Neutral => &self.neutral,
        };
        list.get(i).ok_or_else(|| {
            Error::Consistency(format!("no {label} regressor for bin {i} ({} loaded)", list.len()))
        })
    }
}

/// Classifier plus regressors.
#[derive(Clone)]
pub struct ModelSet {
    /// Charged-vs-neutral classifier.
    pub classifier: Arc<dyn Network>,
    /// Per-bin regressors.
    pub regressors: RegressorModels,
}
