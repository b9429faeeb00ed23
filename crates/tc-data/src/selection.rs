//! Cluster selection cuts and class balancing.

use serde::{Deserialize, Serialize};
use tc_core::Result;

use crate::branches::ClusterBranches;
use crate::sample::ClusterSample;
use crate::table::ClusterTable;

/// Per-cluster selection. Unset cuts are not applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selection {
    /// Keep clusters with `clusterE > min_energy`.
    pub min_energy: Option<f64>,
    /// Keep clusters with `|clusterEta| < max_abs_eta`.
    pub max_abs_eta: Option<f64>,
    /// Keep clusters with `cluster_nCells >= min_cells`.
    pub min_cells: Option<f64>,
}

impl Selection {
    /// Selection with no cuts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum energy cut.
    pub fn min_energy(mut self, e: f64) -> Self {
        self.min_energy = Some(e);
        self
    }

    /// Set the maximum |eta| cut.
    pub fn max_abs_eta(mut self, eta: f64) -> Self {
        self.max_abs_eta = Some(eta);
        self
    }

    /// Set the minimum cell-count cut.
    pub fn min_cells(mut self, n: f64) -> Self {
        self.min_cells = Some(n);
        self
    }

    /// Rows passing every configured cut, in ascending order.
    pub fn passing_rows(
        &self,
        table: &ClusterTable,
        branches: &ClusterBranches,
    ) -> Result<Vec<usize>> {
        let energy = match self.min_energy {
            Some(_) => Some(table.require(&branches.energy)?),
            None => None,
        };
        let eta = match self.max_abs_eta {
            Some(_) => Some(table.require(&branches.eta)?),
            None => None,
        };
        let n_cells = match self.min_cells {
            Some(_) => Some(table.require(&branches.n_cells)?),
            None => None,
        };

        let rows = (0..table.n_rows())
            .filter(|&i| {
                let e_ok = match (self.min_energy, energy) {
                    (Some(cut), Some(col)) => col[i] > cut,
                    _ => true,
                };
                let eta_ok = match (self.max_abs_eta, eta) {
                    (Some(cut), Some(col)) => col[i].abs() < cut,
                    _ => true,
                };
                let cells_ok = match (self.min_cells, n_cells) {
                    (Some(cut), Some(col)) => col[i] >= cut,
                    _ => true,
                };
                e_ok && eta_ok && cells_ok
            })
            .collect();
        Ok(rows)
    }

    /// Apply the cuts, returning the passing clusters.
    pub fn apply(&self, sample: &ClusterSample, branches: &ClusterBranches) -> Result<ClusterSample> {
        let rows = self.passing_rows(sample.table(), branches)?;
        tracing::info!(
            before = sample.n_rows(),
            after = rows.len(),
            "applied cluster selection"
        );
        sample.take_rows(&rows)
    }
}

/// Truncate two labelled samples to the size of the smaller one.
pub fn balance(a: &ClusterSample, b: &ClusterSample) -> Result<(ClusterSample, ClusterSample)> {
    let n = a.n_rows().min(b.n_rows());
    tracing::debug!(a = a.n_rows(), b = b.n_rows(), kept = n, "balancing labelled samples");
    Ok((a.head(n)?, b.head(n)?))
}
