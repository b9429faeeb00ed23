//! Common data types for topocal

use std::f64::consts::PI;
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Particle-type label a regressor is specialized for.
///
/// The classifier score measures how charged-like a cluster is; the blender
/// picks the charged regression above the threshold and the neutral one
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassLabel {
    /// Charged pion-like deposit.
    Charged,
    /// Neutral pion-like deposit.
    Neutral,
}

impl ClassLabel {
    /// Both labels in canonical order.
    pub const ALL: [ClassLabel; 2] = [ClassLabel::Charged, ClassLabel::Neutral];

    /// Stable key used in file names and cache columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassLabel::Charged => "charged",
            ClassLabel::Neutral => "neutral",
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "charged" => Ok(ClassLabel::Charged),
            "neutral" => Ok(ClassLabel::Neutral),
            other => Err(Error::Validation(format!(
                "unknown class label '{other}' (expected 'charged' or 'neutral')"
            ))),
        }
    }
}

/// Geometry of one calorimeter layer image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Layer name (e.g. `"EMB1"`).
    pub name: String,
    /// Number of cells along eta.
    pub eta_bins: usize,
    /// Number of cells along phi.
    pub phi_bins: usize,
}

impl LayerSpec {
    /// Create a layer spec.
    pub fn new(name: impl Into<String>, eta_bins: usize, phi_bins: usize) -> Self {
        Self { name: name.into(), eta_bins, phi_bins }
    }

    /// Number of cells in one image of this layer.
    pub fn n_cells(&self) -> usize {
        self.eta_bins * self.phi_bins
    }
}

/// The barrel EM and tile layers used by the pion calibration networks.
pub fn default_layers() -> Vec<LayerSpec> {
    vec![
        LayerSpec::new("EMB1", 128, 4),
        LayerSpec::new("EMB2", 16, 16),
        LayerSpec::new("EMB3", 8, 16),
        LayerSpec::new("TileBar0", 4, 4),
        LayerSpec::new("TileBar1", 4, 4),
        LayerSpec::new("TileBar2", 2, 4),
    ]
}

/// Wrap an azimuthal difference into `(-pi, pi]`.
pub fn delta_phi(a: f64, b: f64) -> f64 {
    let mut d = (a - b) % (2.0 * PI);
    if d > PI {
        d -= 2.0 * PI;
    } else if d <= -PI {
        d += 2.0 * PI;
    }
    d
}

/// Cartesian four-momentum `(E, px, py, pz)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FourMomentum {
    /// Energy.
    pub e: f64,
    /// x momentum.
    pub px: f64,
    /// y momentum.
    pub py: f64,
    /// z momentum.
    pub pz: f64,
}

impl FourMomentum {
    /// Create from Cartesian components.
    pub fn new(e: f64, px: f64, py: f64, pz: f64) -> Self {
        Self { e, px, py, pz }
    }

    /// Massless four-vector from energy and direction; this is how
    /// topo-clusters enter jet finding.
    pub fn massless(e: f64, eta: f64, phi: f64) -> Self {
        let pt = e / eta.cosh();
        Self { e, px: pt * phi.cos(), py: pt * phi.sin(), pz: pt * eta.sinh() }
    }

    /// Four-vector from `(pt, eta, phi, E)`.
    pub fn from_pt_eta_phi_e(pt: f64, eta: f64, phi: f64, e: f64) -> Self {
        Self { e, px: pt * phi.cos(), py: pt * phi.sin(), pz: pt * eta.sinh() }
    }

    /// Transverse momentum.
    pub fn pt(&self) -> f64 {
        self.px.hypot(self.py)
    }

    /// Pseudorapidity. Zero for a vector along the beam with no transverse part.
    pub fn eta(&self) -> f64 {
        let pt = self.pt();
        if pt == 0.0 {
            return 0.0;
        }
        (self.pz / pt).asinh()
    }

    /// Azimuthal angle in `(-pi, pi]`.
    pub fn phi(&self) -> f64 {
        self.py.atan2(self.px)
    }

    /// Invariant mass; negative mass-squared from rounding is clamped to zero.
    pub fn mass(&self) -> f64 {
        let m2 = self.e * self.e - self.px * self.px - self.py * self.py - self.pz * self.pz;
        m2.max(0.0).sqrt()
    }

    /// `ΔR = sqrt(Δη² + Δφ²)` between two vectors.
    pub fn delta_r(&self, other: &FourMomentum) -> f64 {
        let deta = self.eta() - other.eta();
        let dphi = delta_phi(self.phi(), other.phi());
        deta.hypot(dphi)
    }
}

impl Add for FourMomentum {
    type Output = FourMomentum;

    fn add(self, rhs: FourMomentum) -> FourMomentum {
        FourMomentum {
            e: self.e + rhs.e,
            px: self.px + rhs.px,
            py: self.py + rhs.py,
            pz: self.pz + rhs.pz,
        }
    }
}

impl std::iter::Sum for FourMomentum {
    fn sum<I: Iterator<Item = FourMomentum>>(iter: I) -> Self {
        iter.fold(FourMomentum::default(), |acc, p| acc + p)
    }
}
