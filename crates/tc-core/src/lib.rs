//! # tc-core
//!
//! Core types, error handling and backend traits shared by the topocal crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{InputTensor, JetAlgorithm, Network, NetworkInputs};
pub use types::{ClassLabel, FourMomentum, LayerSpec, default_layers, delta_phi};

/// topocal version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
