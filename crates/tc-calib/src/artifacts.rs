//! Model artifact manifest (`models.json`) and artifact fingerprints.
//!
//! The manifest names the classifier, one scaler per energy bin and one
//! regressor per (bin, class label). Paths are relative to the manifest
//! directory.
//!
//! ```json
//! {
//!   "schema_version": "topocal_models_v0",
//!   "classifier": { "file": "clf.onnx", "layers": ["EMB1", "EMB2"], "output_column": 0 },
//!   "scalers": ["scaler_bin0.json", "scaler_bin1.json"],
//!   "regressors": {
//!     "charged": [{ "file": "reg_charged_bin0.onnx", "layers": ["EMB1"], "scalars": ["logE", "abs_eta"] }],
//!     "neutral": [{ "file": "reg_neutral_bin0.onnx", "layers": ["EMB1"], "scalars": ["logE", "abs_eta"] }]
//!   },
//!   "target_encoding": "ratio"
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tc_core::{ClassLabel, Error, LayerSpec, Result};
use tc_data::ClusterBranches;

use crate::binning::EnergyBins;
use crate::scaler::{ScalerBank, ScalerSet, ScalerSharing};

/// Expected value of [`ArtifactManifest::schema_version`].
pub const MODELS_MANIFEST_SCHEMA_VERSION: &str = "topocal_models_v0";

/// One network artifact and the inputs it is fed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// ONNX file, relative to the manifest directory.
    pub file: String,
    /// Bin identifier; regressors default to the trailing `_`-token of the file stem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,
    /// Cell-image layers fed to the network, one input each (or stacked, see `rescale_to`).
    #[serde(default)]
    pub layers: Vec<String>,
    /// Scalar features fed as a final `[batch, n]` input.
    ///
    /// For regressors these are scaled with the bin's scaler and must match
    /// its feature list.
    #[serde(default)]
    pub scalars: Vec<String>,
    /// Rescale every layer to `[eta, phi]` and stack them as channels of one input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rescale_to: Option<[usize; 2]>,
    /// Feed each layer as `[batch, eta * phi]` instead of `[batch, eta, phi, 1]`.
    #[serde(default)]
    pub flatten: bool,
    /// Output column holding the prediction (the charged-class probability for classifiers).
    #[serde(default)]
    pub output_column: usize,
}

impl NetworkSpec {
    /// Bin identifier for a regressor.
    pub fn bin_tag(&self) -> Option<String> {
        if let Some(b) = &self.bin {
            return Some(b.clone());
        }
        let stem = Path::new(&self.file).file_stem()?.to_str()?;
        stem.rsplit('_').next().map(str::to_string)
    }

    /// Check the network inputs against the configured layers.
    pub fn check_layers(&self, layers: &[LayerSpec]) -> Result<()> {
        if self.layers.is_empty() && self.scalars.is_empty() {
            return Err(Error::Validation(format!("network '{}' declares no inputs", self.file)));
        }
        for name in &self.layers {
            if !layers.iter().any(|l| &l.name == name) {
                return Err(Error::Validation(format!(
                    "network '{}' uses layer '{name}' which is not configured",
                    self.file
                )));
            }
        }
        if let Some([eta, phi]) = self.rescale_to {
            if eta == 0 || phi == 0 {
                return Err(Error::Validation(format!(
                    "network '{}': rescale_to must be positive, got [{eta}, {phi}]",
                    self.file
                )));
            }
        }
        Ok(())
    }
}

/// Per-class regressor lists, in bin order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressorSet {
    /// Regressors applied to charged-classified clusters.
    pub charged: Vec<NetworkSpec>,
    /// Regressors applied to neutral-classified clusters.
    pub neutral: Vec<NetworkSpec>,
}

impl RegressorSet {
    /// Regressors of one class label.
    pub fn for_class(&self, label: ClassLabel) -> &[NetworkSpec] {
        match label {
            ClassLabel::Charged => &self.charged,
            ClassLabel::Neutral => &self.neutral,
        }
    }
}

/// What the regressors predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetEncoding {
    /// `E_true / E_reco`.
    #[default]
    Ratio,
    /// `ln(E_true / E_reco)`.
    LogRatio,
}

impl TargetEncoding {
    /// Decoded calibration ratio.
    #[inline]
    pub fn decode(self, v: f64) -> f64 {
        match self {
            Self::Ratio => v,
            Self::LogRatio => v.exp(),
        }
    }
}

/// Top-level artifact manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Schema version tag (must be `"topocal_models_v0"`).
    pub schema_version: String,
    /// Charged-vs-neutral classifier.
    pub classifier: NetworkSpec,
    /// One input scaler per bin (shared, or the charged list with `per_class`).
    pub scalers: Vec<String>,
    /// Neutral-class input scalers, required with `per_class` sharing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalers_neutral: Option<Vec<String>>,
    /// Per-bin regressors for each class label.
    pub regressors: RegressorSet,
    /// Optional per-bin target scalers (inverse-applied to regressor outputs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_scalers: Option<Vec<String>>,
    /// Regression target encoding.
    #[serde(default)]
    pub target_encoding: TargetEncoding,
    /// Free-form training provenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<serde_json::Value>,
}

impl ArtifactManifest {
    /// Load a manifest from a JSON file path.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Validation(format!("failed to read model manifest {}: {e}", path.display()))
        })?;
        let manifest: Self = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Validation(format!("failed to parse model manifest {}: {e}", path.display()))
        })?;
        if manifest.schema_version != MODELS_MANIFEST_SCHEMA_VERSION {
            return Err(Error::Validation(format!(
                "unsupported model manifest schema_version: '{}' (expected '{}')",
                manifest.schema_version, MODELS_MANIFEST_SCHEMA_VERSION
            )));
        }
        Ok(manifest)
    }

    /// Structural checks against the energy bins and layer geometry.
    ///
    /// Enforces one scaler and one regressor per class label for every bin
    /// edge. Does not open any artifact.
    pub fn validate(
        &self,
        bins: &EnergyBins,
        layers: &[LayerSpec],
        sharing: ScalerSharing,
    ) -> Result<()> {
        let n = bins.n_bins();
        let count = |what: &str, got: usize| -> Result<()> {
            if got != n {
                return Err(Error::Consistency(format!(
                    "{got} {what} listed for {n} energy bins"
                )));
            }
            Ok(())
        };
        count("scalers", self.scalers.len())?;
        match (sharing, &self.scalers_neutral) {
            (ScalerSharing::PerClass, Some(neutral)) => count("neutral scalers", neutral.len())?,
            (ScalerSharing::PerClass, None) => {
                return Err(Error::Validation(
                    "per_class scaler sharing requires 'scalers_neutral' in the manifest".into(),
                ));
            }
            (ScalerSharing::Shared, _) => {}
        }
        for label in ClassLabel::ALL {
            count(&format!("{label} regressors"), self.regressors.for_class(label).len())?;
        }
        if let Some(ts) = &self.target_scalers {
            count("target scalers", ts.len())?;
        }

        self.classifier.check_layers(layers)?;
        for label in ClassLabel::ALL {
            for spec in self.regressors.for_class(label) {
                spec.check_layers(layers)?;
            }
        }
        Ok(())
    }

    /// Regressor and scaler artifacts of each bin carry the same bin identifier.
    pub fn check_bin_tags(&self, scalers: &ScalerSet) -> Result<()> {
        for label in ClassLabel::ALL {
            let bank: &ScalerBank = scalers.for_class(label);
            for (i, spec) in self.regressors.for_class(label).iter().enumerate() {
                let scaler = bank.get(i)?;
                let tag = spec.bin_tag().ok_or_else(|| {
                    Error::Consistency(format!("cannot derive a bin tag from '{}'", spec.file))
                })?;
                if tag != scaler.bin {
                    return Err(Error::Consistency(format!(
                        "bin {i}: {label} regressor '{}' is tagged '{tag}' but its scaler is fit for '{}'",
                        spec.file, scaler.bin
                    )));
                }
                if !spec.scalars.is_empty() {
                    scaler.check_features(&spec.scalars)?;
                }
            }
        }
        Ok(())
    }

    /// Resolve a manifest-relative path.
    pub fn resolve(base_dir: &Path, file: &str) -> PathBuf {
        base_dir.join(file)
    }

    /// Every artifact file the manifest names, in a fixed order.
    pub fn artifact_files(&self) -> Vec<&str> {
        let mut out = vec![self.classifier.file.as_str()];
        out.extend(self.scalers.iter().map(String::as_str));
        if let Some(n) = &self.scalers_neutral {
            out.extend(n.iter().map(String::as_str));
        }
        for label in ClassLabel::ALL {
            out.extend(self.regressors.for_class(label).iter().map(|s| s.file.as_str()));
        }
        if let Some(ts) = &self.target_scalers {
            out.extend(ts.iter().map(String::as_str));
        }
        out
    }
}

/// Incremental SHA-256 over artifacts and settings, rendered as lowercase hex.
#[derive(Debug, Clone, Default)]
pub struct Fingerprint {
    hasher: Sha256,
}

impl Fingerprint {
    /// Empty fingerprint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mix in a labelled byte string.
    pub fn update(&mut self, label: &str, bytes: &[u8]) -> &mut Self {
        self.hasher.update((label.len() as u64).to_le_bytes());
        self.hasher.update(label.as_bytes());
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    /// Mix in the bytes of a file.
    pub fn update_file(&mut self, path: &Path) -> Result<&mut Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Validation(format!("failed to read artifact {}: {e}", path.display()))
        })?;
        let label = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        Ok(self.update(&label, &bytes))
    }

    /// Mix in a list of floats (bit patterns).
    pub fn update_f64s(&mut self, label: &str, values: &[f64]) -> &mut Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_bits().to_le_bytes()).collect();
        self.update(label, &bytes)
    }

    /// Hex digest.
    pub fn finish(self) -> String {
        let out = self.hasher.finalize();
        let mut s = String::with_capacity(64);
        for b in out {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

/// Cache tags for the classification and regression score caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTags {
    /// Tag of the classifier scores.
    pub classification: String,
    /// Tag of the per-class regression ratios.
    pub regression: String,
}

/// Run settings that change what the networks are fed.
#[derive(Debug, Clone, Copy)]
pub struct TagSettings<'a> {
    /// Regression energy bins.
    pub bins: &'a EnergyBins,
    /// Configured layer geometry.
    pub layers: &'a [LayerSpec],
    /// Scaler sharing mode of the regressors.
    pub sharing: ScalerSharing,
    /// Column names the scalar features are derived from.
    pub branches: &'a ClusterBranches,
}

impl TagSettings<'_> {
    fn mix_inputs(&self, fp: &mut Fingerprint, specs: &[&NetworkSpec]) -> Result<()> {
        let used: Vec<&LayerSpec> = self
            .layers
            .iter()
            .filter(|l| specs.iter().any(|s| s.layers.contains(&l.name)))
            .collect();
        fp.update("layers", &serde_json::to_vec(&used)?);
        fp.update("energy_branch", self.branches.energy.as_bytes());
        fp.update("eta_branch", self.branches.eta.as_bytes());
        Ok(())
    }
}

/// Fingerprint the artifacts and settings that produce each cache.
///
/// The classification tag covers the classifier spec and file. The
/// regression tag covers the scalers the sharing mode applies, regressors,
/// target scalers, encoding and the bin edges. Both cover the geometry of
/// the layers their networks read and the energy/eta branch names.
pub fn cache_tags(
    manifest: &ArtifactManifest,
    base_dir: &Path,
    settings: &TagSettings<'_>,
) -> Result<CacheTags> {
    let mut clf = Fingerprint::new();
    clf.update("classifier", &serde_json::to_vec(&manifest.classifier)?);
    clf.update_file(&ArtifactManifest::resolve(base_dir, &manifest.classifier.file))?;
    settings.mix_inputs(&mut clf, &[&manifest.classifier])?;

    let mut reg = Fingerprint::new();
    reg.update_f64s("edges", settings.bins.edges());
    reg.update("sharing", &serde_json::to_vec(&settings.sharing)?);
    reg.update("regressors", &serde_json::to_vec(&manifest.regressors)?);
    reg.update("target_encoding", &serde_json::to_vec(&manifest.target_encoding)?);
    let regressors: Vec<&NetworkSpec> =
        ClassLabel::ALL.iter().flat_map(|&l| manifest.regressors.for_class(l)).collect();
    settings.mix_inputs(&mut reg, &regressors)?;

    let mut files: Vec<&str> = manifest.scalers.iter().map(String::as_str).collect();
    if let (ScalerSharing::PerClass, Some(n)) = (settings.sharing, &manifest.scalers_neutral) {
        files.extend(n.iter().map(String::as_str));
    }
    files.extend(regressors.iter().map(|s| s.file.as_str()));
    if let Some(ts) = &manifest.target_scalers {
        files.extend(ts.iter().map(String::as_str));
    }
    for f in files {
        reg.update_file(&ArtifactManifest::resolve(base_dir, f))?;
    }

    Ok(CacheTags { classification: clf.finish(), regression: reg.finish() })
}
