//! Derived per-cluster features.

use tc_core::Result;

use crate::branches::ClusterBranches;
use crate::table::ClusterTable;

/// Natural log of the reconstructed cluster energy.
pub const LOG_ENERGY: &str = "logE";
/// Absolute pseudorapidity.
pub const ABS_ETA: &str = "abs_eta";
/// Truth calibration ratio `ENG_CALIB_TOT / clusterE`.
pub const CALIB_RATIO: &str = "calib_ratio";

/// Feature order the regression scalers are fit on.
pub fn regression_features() -> Vec<String> {
    vec![LOG_ENERGY.to_string(), ABS_ETA.to_string()]
}

/// `true` when `logE` is defined for energy `e`.
#[inline]
pub fn has_log_energy(e: f64) -> bool {
    e.is_finite() && e > 0.0
}

/// Append `logE`, `abs_eta` and, when truth is available, `calib_ratio`.
///
/// Returns a new table. Clusters without a positive finite energy (noise,
/// negative-energy clusters) get NaN for `logE` and `calib_ratio`.
pub fn derive_features(table: &ClusterTable, branches: &ClusterBranches) -> Result<ClusterTable> {
    let energy = table.require(&branches.energy)?;
    let eta = table.require(&branches.eta)?;

    let log_e: Vec<f64> =
        energy.iter().map(|&e| if has_log_energy(e) { e.ln() } else { f64::NAN }).collect();
    let abs_eta: Vec<f64> = eta.iter().map(|x| x.abs()).collect();
    let mut derived = vec![(LOG_ENERGY.to_string(), log_e), (ABS_ETA.to_string(), abs_eta)];

    if let Some(truth) = table.column(&branches.eng_calib_tot) {
        let ratio: Vec<f64> = truth
            .iter()
            .zip(energy)
            .map(|(t, &e)| if has_log_energy(e) { t / e } else { f64::NAN })
            .collect();
        derived.push((CALIB_RATIO.to_string(), ratio));
    }

    let n_undefined = energy.iter().filter(|&&e| !has_log_energy(e)).count();
    tracing::debug!(
        rows = table.n_rows(),
        columns = derived.len(),
        non_positive = n_undefined,
        "derived cluster features"
    );
    table.with_columns(derived)
}
