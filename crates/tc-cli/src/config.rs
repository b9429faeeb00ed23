//! Analysis config (`topocal_analysis_v0`), YAML or JSON.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tc_calib::{BelowRangePolicy, EnergyBins, PipelineSettings, ScalerSharing};
use tc_core::{LayerSpec, default_layers};
use tc_data::{ClusterBranches, JetBranches, Selection};
use tc_jets::{JetDefinition, StudyConfig};

pub const ANALYSIS_SCHEMA_V0: &str = "topocal_analysis_v0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub schema_version: String,

    /// Calorimeter layers read from the cluster files, in channel order.
    #[serde(default = "default_layers")]
    pub layers: Vec<LayerSpec>,

    #[serde(default)]
    pub branches: ClusterBranches,

    #[serde(default)]
    pub jet_branches: JetBranches,

    /// Lower edges of the regression energy bins.
    pub bin_edges: EnergyBins,

    /// Scores above this select the charged regression.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    pub paths: PathsConfig,

    #[serde(default)]
    pub selection: Selection,

    #[serde(default)]
    pub below_range: BelowRangePolicy,

    #[serde(default)]
    pub scaler_sharing: ScalerSharing,

    #[serde(default)]
    pub jet_definition: JetDefinition,

    #[serde(default)]
    pub study: StudyConfig,

    /// Reference jet collections compared against; others in the jet file are ignored.
    #[serde(default = "default_reference_collections")]
    pub reference_collections: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Input cluster Parquet file.
    pub clusters: PathBuf,
    /// Model manifest (`topocal_models_v0`).
    pub manifest: PathBuf,
    /// Reference jet Parquet file; no jet study without it.
    #[serde(default)]
    pub jets: Option<PathBuf>,
    /// Score cache directory; scores are always recomputed without it.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Calibrated cluster Parquet output.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Jet study JSON report.
    #[serde(default)]
    pub report: Option<PathBuf>,
}

fn default_threshold() -> f64 {
    0.5
}

fn default_reference_collections() -> Vec<String> {
    vec!["AntiKt4EMTopoJets".to_string(), "AntiKt4LCTopoJets".to_string()]
}

impl AnalysisConfig {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            bins: self.bin_edges.clone(),
            threshold: self.threshold,
            below_range: self.below_range,
            branches: self.branches.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != ANALYSIS_SCHEMA_V0 {
            anyhow::bail!(
                "unsupported analysis config schema_version: '{}' (expected '{}')",
                self.schema_version,
                ANALYSIS_SCHEMA_V0
            );
        }
        if !self.threshold.is_finite() {
            anyhow::bail!("threshold must be finite, got {}", self.threshold);
        }
        let mut names: Vec<&str> = self.layers.iter().map(|l| l.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            anyhow::bail!("duplicate layer names in config: {names:?}");
        }
        if let Some(l) = self.layers.iter().find(|l| l.n_cells() == 0) {
            anyhow::bail!("layer '{}' has an empty image shape", l.name);
        }
        self.jet_definition.validate()?;
        self.study.validate()?;
        Ok(())
    }

    /// Resolve relative paths against `base`.
    fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        let paths = &mut self.paths;
        join(&mut paths.clusters);
        join(&mut paths.manifest);
        for p in [&mut paths.jets, &mut paths.cache_dir, &mut paths.output, &mut paths.report] {
            if let Some(p) = p.as_mut() {
                join(p);
            }
        }
    }
}

/// Read, resolve and validate a config. `.json` files are JSON, anything else YAML.
pub fn read_config(path: &Path) -> Result<AnalysisConfig> {
    let bytes = std::fs::read(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    let mut cfg: AnalysisConfig = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        serde_yaml_ng::from_slice(&bytes)?
    };
    cfg.validate()?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    cfg.resolve_paths(base);
    tracing::info!(path = %path.display(), bins = cfg.bin_edges.n_bins(), "analysis config loaded");
    Ok(cfg)
}
