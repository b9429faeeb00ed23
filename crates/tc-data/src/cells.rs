//! Per-cluster calorimeter cell images.
//!
//! Each layer stores one row-major `eta_bins × phi_bins` image per cluster in
//! a single flat buffer, so row `i` of every layer belongs to cluster `i` of
//! the accompanying [`ClusterTable`](crate::ClusterTable).

use std::sync::Arc;

use tc_core::{Error, LayerSpec, Result};

/// All images of one calorimeter layer.
#[derive(Debug, Clone)]
pub struct LayerImages {
    spec: LayerSpec,
    data: Arc<[f32]>,
}

impl LayerImages {
    /// Layer geometry.
    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }

    /// Image of one cluster.
    pub fn image(&self, row: usize) -> &[f32] {
        let n = self.spec.n_cells();
        &self.data[row * n..(row + 1) * n]
    }

    /// Flat buffer of all images (`n_rows × n_cells`).
    pub fn as_flat(&self) -> &[f32] {
        &self.data
    }
}

/// Images of every configured layer for a set of clusters.
#[derive(Debug, Clone)]
pub struct CellImages {
    n_rows: usize,
    layers: Vec<LayerImages>,
}

impl CellImages {
    /// Build from flat per-layer buffers.
    pub fn new(n_rows: usize, layers: Vec<(LayerSpec, Vec<f32>)>) -> Result<Self> {
        let mut out = Vec::with_capacity(layers.len());
        for (spec, data) in layers {
            if out.iter().any(|l: &LayerImages| l.spec.name == spec.name) {
                return Err(Error::Validation(format!("duplicate layer '{}'", spec.name)));
            }
            let expected = n_rows * spec.n_cells();
            if data.len() != expected {
                return Err(Error::Validation(format!(
                    "layer '{}' ({}x{}): expected {} values for {} clusters, got {}",
                    spec.name,
                    spec.eta_bins,
                    spec.phi_bins,
                    expected,
                    n_rows,
                    data.len()
                )));
            }
            out.push(LayerImages { spec, data: data.into() });
        }
        Ok(Self { n_rows, layers: out })
    }

    /// Images without any layer, for inputs that carry scalars only.
    pub fn empty(n_rows: usize) -> Self {
        Self { n_rows, layers: Vec::new() }
    }

    /// Number of clusters.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Layer geometries in storage order.
    pub fn layer_specs(&self) -> Vec<&LayerSpec> {
        self.layers.iter().map(|l| &l.spec).collect()
    }

    /// Look up a layer by name.
    pub fn layer(&self, name: &str) -> Result<&LayerImages> {
        self.layers.iter().find(|l| l.spec.name == name).ok_or_else(|| {
            Error::Validation(format!(
                "unknown calorimeter layer '{name}' (available: {:?})",
                self.layers.iter().map(|l| l.spec.name.as_str()).collect::<Vec<_>>()
            ))
        })
    }

    /// New image set holding `rows` in the given order.
    pub fn take_rows(&self, rows: &[usize]) -> Result<Self> {
        if let Some(&bad) = rows.iter().find(|&&r| r >= self.n_rows) {
            return Err(Error::Validation(format!(
                "row index {bad} out of range for {} cell images",
                self.n_rows
            )));
        }
        let layers = self
            .layers
            .iter()
            .map(|l| {
                let mut data = Vec::with_capacity(rows.len() * l.spec.n_cells());
                for &r in rows {
                    data.extend_from_slice(l.image(r));
                }
                (l.spec.clone(), data)
            })
            .collect();
        Self::new(rows.len(), layers)
    }

    /// Concatenate image sets with identical layer geometry.
    pub fn concat(parts: &[CellImages]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(Error::Validation("concat requires at least one image set".into()));
        };
        let specs: Vec<LayerSpec> = first.layers.iter().map(|l| l.spec.clone()).collect();
        for (i, p) in parts.iter().enumerate().skip(1) {
            let other: Vec<&LayerSpec> = p.layer_specs();
            if other.len() != specs.len() || other.iter().zip(&specs).any(|(a, b)| *a != b) {
                return Err(Error::Validation(format!("image set {i} has different layers")));
            }
        }
        let n_rows = parts.iter().map(|p| p.n_rows).sum();
        let layers = specs
            .iter()
            .enumerate()
            .map(|(li, spec)| {
                let data: Vec<f32> =
                    parts.iter().flat_map(|p| p.layers[li].data.iter().copied()).collect();
                (spec.clone(), data)
            })
            .collect();
        Self::new(n_rows, layers)
    }
}

/// Fraction of each source bin that falls into each target bin on `[0, 1)`.
///
/// `weights[o][i]` sums to one over `o` for every source bin `i`.
fn overlap_weights(n_src: usize, n_dst: usize) -> Vec<Vec<f32>> {
    let mut w = vec![vec![0.0f32; n_src]; n_dst];
    for (o, row) in w.iter_mut().enumerate() {
        let o_lo = o as f64 / n_dst as f64;
        let o_hi = (o + 1) as f64 / n_dst as f64;
        for (i, cell) in row.iter_mut().enumerate() {
            let i_lo = i as f64 / n_src as f64;
            let i_hi = (i + 1) as f64 / n_src as f64;
            let overlap = (o_hi.min(i_hi) - o_lo.max(i_lo)).max(0.0);
            *cell = (overlap * n_src as f64) as f32;
        }
    }
    w
}

/// Resample one layer image onto an `eta_out × phi_out` grid.
///
/// Cell energies are redistributed by geometric overlap, so the summed energy
/// of the image is unchanged. This lets layers of different granularity be
/// stacked as channels of one tensor.
pub fn rescale_image(image: &[f32], from: &LayerSpec, eta_out: usize, phi_out: usize) -> Vec<f32> {
    let we = overlap_weights(from.eta_bins, eta_out);
    let wp = overlap_weights(from.phi_bins, phi_out);
    let mut out = vec![0.0f32; eta_out * phi_out];
    for (oe, we_row) in we.iter().enumerate() {
        for (ie, &fe) in we_row.iter().enumerate() {
            if fe == 0.0 {
                continue;
            }
            let src = &image[ie * from.phi_bins..(ie + 1) * from.phi_bins];
            for (op, wp_row) in wp.iter().enumerate() {
                let mut acc = 0.0f32;
                for (ip, &fp) in wp_row.iter().enumerate() {
                    acc += src[ip] * fp;
                }
                out[oe * phi_out + op] += fe * acc;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_layer_images() -> CellImages {
        CellImages::new(
            2,
            vec![
                (LayerSpec::new("EMB2", 2, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]),
                (LayerSpec::new("TileBar0", 1, 2), vec![0.5, 0.5, 1.5, 2.5]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_layer_lookup_and_rows() {
        let imgs = two_layer_images();
        assert_eq!(imgs.layer("EMB2").unwrap().image(1), &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(imgs.layer("TileBar0").unwrap().image(0), &[0.5, 0.5]);
        assert!(imgs.layer("EMB9").is_err());
    }

    #[test]
    fn test_new_rejects_wrong_size() {
        let err = CellImages::new(2, vec![(LayerSpec::new("EMB2", 2, 2), vec![0.0; 7])]);
        assert!(err.is_err());
    }

    #[test]
    fn test_take_rows_and_concat() {
        let imgs = two_layer_images();
        let swapped = imgs.take_rows(&[1, 0]).unwrap();
        assert_eq!(swapped.layer("EMB2").unwrap().image(0), &[5.0, 6.0, 7.0, 8.0]);
        let both = CellImages::concat(&[imgs.clone(), swapped]).unwrap();
        assert_eq!(both.n_rows(), 4);
        assert_eq!(both.layer("TileBar0").unwrap().image(3), &[0.5, 0.5]);
    }

    #[test]
    fn test_rescale_preserves_energy() {
        let spec = LayerSpec::new("EMB1", 128, 4);
        let image: Vec<f32> = (0..spec.n_cells()).map(|i| (i % 7) as f32 * 0.25).collect();
        let total: f32 = image.iter().sum();
        let out = rescale_image(&image, &spec, 16, 16);
        assert_eq!(out.len(), 256);
        assert_relative_eq!(out.iter().sum::<f32>(), total, max_relative = 1e-4);
    }

    #[test]
    fn test_rescale_identity_shape() {
        let spec = LayerSpec::new("EMB2", 2, 2);
        let image = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(rescale_image(&image, &spec, 2, 2), image);
    }

    #[test]
    fn test_rescale_upsample_splits_cells() {
        let spec = LayerSpec::new("TileBar2", 1, 1);
        let out = rescale_image(&[4.0], &spec, 2, 2);
        assert_eq!(out, vec![1.0, 1.0, 1.0, 1.0]);
    }
}
