//! # tc-jets
//!
//! Jet clustering of calibrated topo-clusters and the jet response study
//! against reference jet collections.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod algorithm;
pub mod constituents;
pub mod matching;
pub mod study;

#[cfg(feature = "jetty")]
pub use algorithm::AntiKt;
pub use algorithm::{JetDefinition, anti_kt, cluster_events, sort_by_pt};
pub use constituents::constituents_by_event;
pub use matching::{JetMatch, match_jets};
pub use study::{
    ComparisonReport, ResponseBin, STUDY_SCHEMA_VERSION, StudyConfig, StudyReport, compare,
    run_study,
};
