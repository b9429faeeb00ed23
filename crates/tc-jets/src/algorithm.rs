//! Jet definitions and the clustering backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tc_core::{Error, FourMomentum, JetAlgorithm, Result};
use tc_data::JetCollection;

/// Sequential-recombination parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JetDefinition {
    /// Radius parameter `R`.
    pub radius: f64,
    /// Jets below this transverse momentum are discarded.
    pub min_pt: f64,
}

impl Default for JetDefinition {
    fn default() -> Self {
        Self { radius: 0.4, min_pt: 5.0 }
    }
}

impl JetDefinition {
    /// Reject non-physical parameters.
    pub fn validate(&self) -> Result<()> {
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(Error::Validation(format!("jet radius must be > 0, got {}", self.radius)));
        }
        if !(self.min_pt.is_finite() && self.min_pt >= 0.0) {
            return Err(Error::Validation(format!("jet min_pt must be >= 0, got {}", self.min_pt)));
        }
        Ok(())
    }
}

/// Anti-kt clustering through `jetty`.
#[cfg(feature = "jetty")]
#[derive(Debug, Clone)]
pub struct AntiKt {
    definition: JetDefinition,
}

#[cfg(feature = "jetty")]
impl AntiKt {
    /// Anti-kt with the given radius and `min_pt` cut.
    pub fn new(definition: JetDefinition) -> Result<Self> {
        definition.validate()?;
        Ok(Self { definition })
    }
}

#[cfg(feature = "jetty")]
impl JetAlgorithm for AntiKt {
    fn cluster(&self, constituents: &[FourMomentum]) -> Result<Vec<FourMomentum>> {
        use jetty::{anti_kt_f, cluster_if, pseudojet};

        if let Some(bad) = constituents
            .iter()
            .find(|p| ![p.e, p.px, p.py, p.pz].iter().all(|v| v.is_finite()))
        {
            return Err(Error::Computation(format!("non-finite constituent {bad:?}")));
        }
        let partons: Vec<_> = constituents.iter().map(|p| pseudojet!(p.e, p.px, p.py, p.pz)).collect();
        let min_pt2 = self.definition.min_pt * self.definition.min_pt;
        let jets = cluster_if(partons, &anti_kt_f(self.definition.radius), |jet| {
            jet.pt2().raw() > min_pt2
        });
        let mut out: Vec<FourMomentum> = jets
            .iter()
            .map(|j| FourMomentum::new(j.e().raw(), j.px().raw(), j.py().raw(), j.pz().raw()))
            .collect();
        sort_by_pt(&mut out);
        Ok(out)
    }

    fn label(&self) -> String {
        format!("anti-kt R={}", self.definition.radius)
    }
}

/// Anti-kt backend for `definition`.
pub fn anti_kt(definition: &JetDefinition) -> Result<Box<dyn JetAlgorithm>> {
    definition.validate()?;
    #[cfg(feature = "jetty")]
    {
        Ok(Box::new(AntiKt::new(definition.clone())?))
    }
    #[cfg(not(feature = "jetty"))]
    {
        Err(Error::NotImplemented(
            "jet clustering needs topocal built with the 'jetty' feature".into(),
        ))
    }
}

/// Sort jets by descending transverse momentum.
pub fn sort_by_pt(jets: &mut [FourMomentum]) {
    jets.sort_by(|a, b| b.pt().total_cmp(&a.pt()));
}

/// Cluster every event into a named jet collection.
pub fn cluster_events(
    name: &str,
    algorithm: &dyn JetAlgorithm,
    events: &BTreeMap<u64, Vec<FourMomentum>>,
) -> Result<JetCollection> {
    let mut out = JetCollection::new(name);
    for (&ev, constituents) in events {
        let mut jets = algorithm.cluster(constituents)?;
        sort_by_pt(&mut jets);
        out.set_event(ev, jets);
    }
    tracing::info!(
        collection = name,
        algorithm = %algorithm.label(),
        events = events.len(),
        jets = out.n_jets(),
        "clustered jets"
    );
    Ok(out)
}
