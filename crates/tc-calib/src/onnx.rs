//! ONNX Runtime network backend.
//!
//! Feature-gated behind `neural`. Without it, [`OnnxLoader`] reports
//! [`Error::NotImplemented`] and only runs with warm score caches succeed.

use std::path::Path;
use std::sync::Arc;
#[cfg(feature = "neural")]
use std::sync::Mutex;

#[cfg(feature = "neural")]
use ort::session::Session;
use tc_core::{Error, Network, Result};
#[cfg(feature = "neural")]
use tc_core::NetworkInputs;

use crate::artifacts::NetworkSpec;
use crate::network::NetworkLoader;
#[cfg(feature = "neural")]
use crate::network::select_output_column;

/// Loads networks with ONNX Runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxLoader {
    /// Intra-op threads per session.
    pub intra_threads: usize,
}

impl OnnxLoader {
    /// Loader with one intra-op thread per session.
    pub fn new() -> Self {
        Self { intra_threads: 1 }
    }
}

impl NetworkLoader for OnnxLoader {
    #[cfg(feature = "neural")]
    fn load(&self, path: &Path, spec: &NetworkSpec) -> Result<Arc<dyn Network>> {
        Ok(Arc::new(OnnxNetwork::open(path, spec, self.intra_threads.max(1))?))
    }

    #[cfg(not(feature = "neural"))]
    fn load(&self, path: &Path, _spec: &NetworkSpec) -> Result<Arc<dyn Network>> {
        Err(Error::NotImplemented(format!(
            "cannot load {}: topocal was built without the 'neural' feature",
            path.display()
        )))
    }
}

/// A network evaluated by ONNX Runtime.
#[cfg(feature = "neural")]
pub struct OnnxNetwork {
    name: String,
    output_column: usize,
    input_names: Vec<String>,
    /// `Session::run` needs `&mut self`.
    session: Mutex<Session>,
}

#[cfg(feature = "neural")]
impl OnnxNetwork {
    /// Open an ONNX file and check its input count against `spec`.
    pub fn open(path: &Path, spec: &NetworkSpec, intra_threads: usize) -> Result<Self> {
        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(intra_threads))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| {
                Error::Validation(format!("failed to load ONNX model {}: {e}", path.display()))
            })?;

        let input_names: Vec<String> =
            session.inputs().iter().map(|input| input.name().to_string()).collect();
        let expected = match spec.rescale_to {
            Some(_) => usize::from(!spec.layers.is_empty()),
            None => spec.layers.len(),
        } + usize::from(!spec.scalars.is_empty());
        if input_names.len() != expected {
            return Err(Error::Validation(format!(
                "ONNX model {} declares {} inputs {:?}, manifest entry feeds {expected}",
                path.display(),
                input_names.len(),
                input_names
            )));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| spec.file.clone());
        tracing::debug!(model = %name, inputs = ?input_names, "loaded ONNX model");
        Ok(Self { name, output_column: spec.output_column, input_names, session: Mutex::new(session) })
    }
}

#[cfg(feature = "neural")]
impl Network for OnnxNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, inputs: &NetworkInputs) -> Result<Vec<f64>> {
        // Tensors are matched to model inputs by position.
        let mut feed = Vec::with_capacity(inputs.tensors.len());
        for (name, t) in self.input_names.iter().zip(&inputs.tensors) {
            let shape: Vec<i64> = t.shape.iter().map(|&d| d as i64).collect();
            let value = ort::value::Tensor::from_array((shape, t.data.clone()))
                .map_err(|e| Error::Validation(format!("ONNX input tensor error: {e}")))?;
            feed.push((name.clone(), value.into_dyn()));
        }

        let mut session = self
            .session
            .lock()
            .map_err(|_| Error::Computation(format!("ONNX session '{}' poisoned", self.name)))?;
        let outputs = session
            .run(feed)
            .map_err(|e| Error::Computation(format!("ONNX inference error in {}: {e}", self.name)))?;
        let (_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Computation(format!("ONNX output extraction error: {e}")))?;

        select_output_column(data, inputs.batch, self.output_column)
    }
}
