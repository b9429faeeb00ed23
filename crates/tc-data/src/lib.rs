//! # tc-data
//!
//! Topo-cluster data model for topocal: columnar cluster tables, calorimeter
//! cell images, derived features, selection, reference jets and Parquet I/O.
//!
//! All stage outputs are new values; inputs are never mutated.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod branches;
pub mod cells;
pub mod features;
pub mod jets;
pub mod parquet_io;
pub mod sample;
pub mod selection;
pub mod table;

pub use branches::{ClusterBranches, JetBranches};
pub use cells::{CellImages, LayerImages, rescale_image};
pub use features::{
    ABS_ETA, CALIB_RATIO, LOG_ENERGY, derive_features, has_log_energy, regression_features,
};
pub use jets::JetCollection;
pub use parquet_io::{
    read_cluster_parquet, read_cluster_parquet_bytes, read_jet_parquet, write_cluster_parquet,
    write_cluster_parquet_bytes, write_jet_parquet,
};
pub use sample::ClusterSample;
pub use selection::{Selection, balance};
pub use table::ClusterTable;
