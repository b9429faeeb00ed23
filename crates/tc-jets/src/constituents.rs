//! Topo-clusters as massless jet constituents.

use std::collections::BTreeMap;

use tc_core::{FourMomentum, Result};
use tc_data::{ClusterBranches, ClusterTable};

/// Massless four-vectors per event, built from `(energy_column, eta, phi)`.
///
/// Clusters with non-positive or non-finite energy are skipped; topo-cluster
/// energies can be negative from noise and carry no jet constituent.
pub fn constituents_by_event(
    table: &ClusterTable,
    branches: &ClusterBranches,
    energy_column: &str,
) -> Result<BTreeMap<u64, Vec<FourMomentum>>> {
    let energy = table.require(energy_column)?;
    let eta = table.require(&branches.eta)?;
    let phi = table.require(&branches.phi)?;

    let mut events: BTreeMap<u64, Vec<FourMomentum>> = BTreeMap::new();
    let mut skipped = 0usize;
    for (row, &ev) in table.events().iter().enumerate() {
        let (e, h, p) = (energy[row], eta[row], phi[row]);
        if !(e.is_finite() && e > 0.0 && h.is_finite() && p.is_finite()) {
            skipped += 1;
            continue;
        }
        events.entry(ev).or_default().push(FourMomentum::massless(e, h, p));
    }
    tracing::debug!(
        column = energy_column,
        events = events.len(),
        skipped,
        "built jet constituents"
    );
    Ok(events)
}
