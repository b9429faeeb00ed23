//! Network input assembly and the model-loading seam.

use std::path::Path;
use std::sync::Arc;

use tc_core::{Error, InputTensor, Network, NetworkInputs, Result};
use tc_data::{ClusterSample, rescale_image};

use crate::artifacts::NetworkSpec;

/// Name of the scalar-feature input tensor.
pub const SCALARS_INPUT: &str = "scalars";
/// Name of the stacked-image input tensor (with `rescale_to`).
pub const STACKED_INPUT: &str = "images";

/// Loads a network artifact.
pub trait NetworkLoader: Sync {
    /// Open the artifact at `path` described by `spec`.
    fn load(&self, path: &Path, spec: &NetworkSpec) -> Result<Arc<dyn Network>>;
}

/// Assemble the inputs of `spec` for the given rows of a sample.
///
/// `scalars` is feature-major and already restricted to `rows`; pass an empty
/// slice when the network takes no scalar input.
pub fn build_inputs(
    sample: &ClusterSample,
    rows: &[usize],
    spec: &NetworkSpec,
    scalars: &[Vec<f64>],
) -> Result<NetworkInputs> {
    let batch = rows.len();
    let mut tensors = Vec::with_capacity(spec.layers.len() + 1);

    match spec.rescale_to {
        Some([eta, phi]) => {
            let n_ch = spec.layers.len();
            let mut data = vec![0.0f32; batch * eta * phi * n_ch];
            for (ch, name) in spec.layers.iter().enumerate() {
                let layer = sample.images().layer(name)?;
                for (b, &row) in rows.iter().enumerate() {
                    let img = rescale_image(layer.image(row), layer.spec(), eta, phi);
                    let base = b * eta * phi * n_ch;
                    for (cell, v) in img.into_iter().enumerate() {
                        data[base + cell * n_ch + ch] = v;
                    }
                }
            }
            if n_ch > 0 {
                tensors.push(InputTensor::new(STACKED_INPUT, vec![batch, eta, phi, n_ch], data)?);
            }
        }
        None => {
            for name in &spec.layers {
                let layer = sample.images().layer(name)?;
                let ls = layer.spec();
                let mut data = Vec::with_capacity(batch * ls.n_cells());
                for &row in rows {
                    data.extend_from_slice(layer.image(row));
                }
                let shape = if spec.flatten {
                    vec![batch, ls.n_cells()]
                } else {
                    vec![batch, ls.eta_bins, ls.phi_bins, 1]
                };
                tensors.push(InputTensor::new(name.clone(), shape, data)?);
            }
        }
    }

    if !spec.scalars.is_empty() {
        if scalars.len() != spec.scalars.len() {
            return Err(Error::Validation(format!(
                "network '{}' expects {} scalar features, got {}",
                spec.file,
                spec.scalars.len(),
                scalars.len()
            )));
        }
        let n = scalars.len();
        let mut data = vec![0.0f32; batch * n];
        for (j, col) in scalars.iter().enumerate() {
            if col.len() != batch {
                return Err(Error::Validation(format!(
                    "scalar feature '{}' has {} values for a batch of {batch}",
                    spec.scalars[j],
                    col.len()
                )));
            }
            for (b, &v) in col.iter().enumerate() {
                data[b * n + j] = v as f32;
            }
        }
        tensors.push(InputTensor::new(SCALARS_INPUT, vec![batch, n], data)?);
    }

    Ok(NetworkInputs { batch, tensors })
}

/// Pick column `column` of a row-major `[batch, width]` output.
pub fn select_output_column(values: &[f32], batch: usize, column: usize) -> Result<Vec<f64>> {
    if batch == 0 {
        return Ok(Vec::new());
    }
    if values.len() % batch != 0 {
        return Err(Error::Computation(format!(
            "network output has {} values, not a multiple of batch {batch}",
            values.len()
        )));
    }
    let width = values.len() / batch;
    if column >= width {
        return Err(Error::Computation(format!(
            "output column {column} requested but the network produces {width} per row"
        )));
    }
    Ok((0..batch).map(|b| values[b * width + column] as f64).collect())
}

/// Evaluate a network on a set of rows; empty row sets skip evaluation.
pub fn predict_rows(
    network: &dyn Network,
    sample: &ClusterSample,
    rows: &[usize],
    spec: &NetworkSpec,
    scalars: &[Vec<f64>],
) -> Result<Vec<f64>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let inputs = build_inputs(sample, rows, spec, scalars)?;
    let out = network.predict(&inputs)?;
    if out.len() != rows.len() {
        return Err(Error::Computation(format!(
            "network '{}' returned {} predictions for {} clusters",
            network.name(),
            out.len(),
            rows.len()
        )));
    }
    tracing::debug!(network = network.name(), rows = rows.len(), "evaluated network");
    Ok(out)
}
