//! Column (branch) names of the cluster and jet tables.

use serde::{Deserialize, Serialize};

/// Names of the per-cluster columns in the input files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterBranches {
    /// Owning event identifier.
    pub event: String,
    /// Reconstructed (EM-scale) cluster energy.
    pub energy: String,
    /// LC-calibrated cluster energy.
    pub energy_calib: String,
    /// Cluster transverse momentum.
    pub pt: String,
    /// Cluster pseudorapidity.
    pub eta: String,
    /// Cluster azimuth.
    pub phi: String,
    /// Number of cells in the cluster.
    pub n_cells: String,
    /// Sum of cell energies.
    pub sum_cell_e: String,
    /// Truth calibration energy (regression target numerator).
    pub eng_calib_tot: String,
    /// Electromagnetic probability from the standard calibration.
    pub em_probability: String,
}

impl Default for ClusterBranches {
    fn default() -> Self {
        Self {
            event: "eventNumber".into(),
            energy: "clusterE".into(),
            energy_calib: "clusterECalib".into(),
            pt: "clusterPt".into(),
            eta: "clusterEta".into(),
            phi: "clusterPhi".into(),
            n_cells: "cluster_nCells".into(),
            sum_cell_e: "cluster_sumCellE".into(),
            eng_calib_tot: "cluster_ENG_CALIB_TOT".into(),
            em_probability: "cluster_EM_PROBABILITY".into(),
        }
    }
}

impl ClusterBranches {
    /// Columns every cluster file must provide.
    pub fn required(&self) -> [&str; 3] {
        [self.energy.as_str(), self.eta.as_str(), self.phi.as_str()]
    }

    /// Columns read when present.
    pub fn optional(&self) -> [&str; 6] {
        [
            self.energy_calib.as_str(),
            self.pt.as_str(),
            self.n_cells.as_str(),
            self.sum_cell_e.as_str(),
            self.eng_calib_tot.as_str(),
            self.em_probability.as_str(),
        ]
    }
}

/// Names of the per-jet columns in reference jet files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JetBranches {
    /// Owning event identifier.
    pub event: String,
    /// Jet transverse momentum.
    pub pt: String,
    /// Jet pseudorapidity.
    pub eta: String,
    /// Jet azimuth.
    pub phi: String,
    /// Jet energy.
    pub e: String,
    /// Collection name (e.g. `AntiKt4EMTopoJets`).
    pub collection: String,
}

impl Default for JetBranches {
    fn default() -> Self {
        Self {
            event: "eventNumber".into(),
            pt: "jet_pt".into(),
            eta: "jet_eta".into(),
            phi: "jet_phi".into(),
            e: "jet_e".into(),
            collection: "collection".into(),
        }
    }
}
