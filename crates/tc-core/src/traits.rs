//! Core traits for topocal
//!
//! The calibration pipeline depends on these seams, not on a concrete
//! inference engine or jet-clustering library. ONNX networks and the anti-kt
//! backend implement them behind optional features.

use crate::types::FourMomentum;
use crate::{Error, Result};

/// One dense `f32` input tensor, row-major, first dimension = batch.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    /// Logical input name (layer name or `"scalars"`).
    pub name: String,
    /// Full shape including the batch dimension.
    pub shape: Vec<usize>,
    /// Flat row-major values.
    pub data: Vec<f32>,
}

impl InputTensor {
    /// Create a tensor, checking that `data` matches `shape`.
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::Validation(format!(
                "input tensor '{name}': shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { name, shape, data })
    }
}

/// Batched network inputs for a set of clusters.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInputs {
    /// Number of clusters in the batch.
    pub batch: usize,
    /// Input tensors in the order the network declares them.
    pub tensors: Vec<InputTensor>,
}

/// A trained network evaluated as a black box.
///
/// `predict` returns exactly one value per batch row: the selected class
/// probability for classifiers, the (scaled) regression target for regressors.
pub trait Network: Send + Sync {
    /// Human-readable identifier (usually the artifact file name).
    fn name(&self) -> &str;

    /// Evaluate the network on a batch.
    fn predict(&self, inputs: &NetworkInputs) -> Result<Vec<f64>>;
}

/// Sequential-recombination jet finder used as an opaque capability.
pub trait JetAlgorithm: Send + Sync {
    /// Cluster the constituents of one event into jets.
    fn cluster(&self, constituents: &[FourMomentum]) -> Result<Vec<FourMomentum>>;

    /// Algorithm label for reports (e.g. `"anti-kt R=0.4"`).
    fn label(&self) -> String;
}
