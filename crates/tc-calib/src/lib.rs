//! # tc-calib
//!
//! Machine-learned energy calibration of topo-clusters.
//!
//! Clusters are routed to energy bins, their features scaled with per-bin
//! fitted scalers, classified as charged or neutral, and regressed with the
//! per-bin network of each class. The two calibrated energies are blended by
//! classification score. Network outputs are persisted in tagged score caches.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod artifacts;
pub mod binning;
pub mod blend;
pub mod models;
pub mod network;
pub mod onnx;
pub mod pipeline;
pub mod scaler;
pub mod score_cache;

pub use artifacts::{
    ArtifactManifest, CacheTags, Fingerprint, NetworkSpec, TagSettings, TargetEncoding,
};
pub use binning::{BinAssignment, EnergyBins};
pub use blend::{apply_ratio, blend};
pub use models::{ArtifactBundle, ModelSet, RegressorModels};
pub use network::{NetworkLoader, build_inputs};
pub use onnx::OnnxLoader;
pub use pipeline::{
    BelowRangePolicy, CalibrationOutput, CalibrationPipeline, PipelineSettings, ScoreCaches,
};
pub use scaler::{FeatureTransform, FittedScaler, ScalerBank, ScalerSet, ScalerSharing};
pub use score_cache::{Lookup, ScoreCache, ScoreRecord, StoredScores, read_scores};
