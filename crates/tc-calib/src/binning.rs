//! Energy-bin routing.
//!
//! Bins are half-open `[edge[i], edge[i+1])`; the last bin is unbounded above.
//! Energies below the first edge (or NaN) are not assigned to any bin.

use serde::{Deserialize, Serialize};
use tc_core::{Error, Result};

/// Ordered lower edges of the regression energy bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct EnergyBins {
    edges: Vec<f64>,
}

impl EnergyBins {
    /// Create from strictly ascending, finite lower edges (at least one).
    pub fn new(edges: Vec<f64>) -> Result<Self> {
        if edges.is_empty() {
            return Err(Error::Validation("energy bins need at least one edge".into()));
        }
        if let Some(e) = edges.iter().find(|e| !e.is_finite()) {
            return Err(Error::Validation(format!("energy bin edge {e} is not finite")));
        }
        for w in edges.windows(2) {
            if w[1] <= w[0] {
                return Err(Error::Validation(format!(
                    "energy bin edges must be strictly ascending, got {} then {}",
                    w[0], w[1]
                )));
            }
        }
        Ok(Self { edges })
    }

    /// Lower edges.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Number of bins (equal to the number of edges).
    pub fn n_bins(&self) -> usize {
        self.edges.len()
    }

    /// Default bin identifier, `bin<i>`.
    pub fn label(i: usize) -> String {
        format!("bin{i}")
    }

    /// Identifiers of all bins.
    pub fn labels(&self) -> Vec<String> {
        (0..self.n_bins()).map(Self::label).collect()
    }

    /// Bin containing `energy`, or `None` below the first edge.
    pub fn bin_of(&self, energy: f64) -> Option<usize> {
        if energy.is_nan() || energy < self.edges[0] {
            return None;
        }
        // Number of edges <= energy, minus one.
        let k = self.edges.partition_point(|&edge| edge <= energy);
        Some(k - 1)
    }

    /// Partition row indices by bin.
    pub fn route(&self, energies: &[f64]) -> BinAssignment {
        let mut per_bin = vec![Vec::new(); self.n_bins()];
        let mut unassigned = Vec::new();
        for (row, &e) in energies.iter().enumerate() {
            match self.bin_of(e) {
                Some(b) => per_bin[b].push(row),
                None => unassigned.push(row),
            }
        }
        BinAssignment { n_rows: energies.len(), per_bin, unassigned }
    }
}

impl TryFrom<Vec<f64>> for EnergyBins {
    type Error = Error;

    fn try_from(edges: Vec<f64>) -> Result<Self> {
        Self::new(edges)
    }
}

impl From<EnergyBins> for Vec<f64> {
    fn from(bins: EnergyBins) -> Self {
        bins.edges
    }
}

/// Result of [`EnergyBins::route`]: row indices per bin, ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinAssignment {
    n_rows: usize,
    per_bin: Vec<Vec<usize>>,
    unassigned: Vec<usize>,
}

impl BinAssignment {
    /// Number of routed rows.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Rows of bin `i`.
    pub fn rows(&self, i: usize) -> &[usize] {
        self.per_bin.get(i).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Rows of every bin, in bin order.
    pub fn per_bin(&self) -> &[Vec<usize>] {
        &self.per_bin
    }

    /// Rows below the first edge.
    pub fn unassigned(&self) -> &[usize] {
        &self.unassigned
    }

    /// Number of assigned rows.
    pub fn n_assigned(&self) -> usize {
        self.per_bin.iter().map(Vec::len).sum()
    }

    /// Bin of each row (`None` for unassigned rows).
    pub fn bin_per_row(&self) -> Vec<Option<usize>> {
        let mut out = vec![None; self.n_rows];
        for (b, rows) in self.per_bin.iter().enumerate() {
            for &r in rows {
                out[r] = Some(b);
            }
        }
        out
    }
}
