//! Geometric matching of jets to reference jets.

use tc_core::FourMomentum;

/// One reference jet matched to one candidate jet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JetMatch {
    /// Index into the reference jets.
    pub reference: usize,
    /// Index into the candidate jets.
    pub candidate: usize,
    /// Separation `ΔR`.
    pub delta_r: f64,
}

/// Greedy `ΔR` matching.
///
/// Reference jets are visited in descending `pt`; each takes the nearest
/// unused candidate closer than `max_delta_r`. Every jet is matched at most
/// once.
pub fn match_jets(
    reference: &[FourMomentum],
    candidates: &[FourMomentum],
    max_delta_r: f64,
) -> Vec<JetMatch> {
    let mut order: Vec<usize> = (0..reference.len()).collect();
    order.sort_by(|&a, &b| reference[b].pt().total_cmp(&reference[a].pt()));

    let mut used = vec![false; candidates.len()];
    let mut out = Vec::new();
    for r in order {
        let best = candidates
            .iter()
            .enumerate()
            .filter(|(c, _)| !used[*c])
            .map(|(c, cand)| (c, reference[r].delta_r(cand)))
            .filter(|(_, dr)| *dr < max_delta_r)
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((c, delta_r)) = best {
            used[c] = true;
            out.push(JetMatch { reference: r, candidate: c, delta_r });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn jet(pt: f64, eta: f64, phi: f64) -> FourMomentum {
        FourMomentum::from_pt_eta_phi_e(pt, eta, phi, pt * eta.cosh())
    }

    #[test]
    fn test_leading_reference_wins_contested_candidate() {
        let reference = [jet(20.0, 0.0, 0.0), jet(50.0, 0.1, 0.0)];
        let candidates = [jet(48.0, 0.05, 0.0)];
        let m = match_jets(&reference, &candidates, 0.3);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].reference, 1);
        assert_eq!(m[0].candidate, 0);
    }

    #[test]
    fn test_nearest_and_radius_cut() {
        let reference = [jet(40.0, 1.0, 1.0)];
        let candidates = [jet(40.0, 1.2, 1.0), jet(40.0, 1.05, 1.0), jet(40.0, 3.0, 1.0)];
        let m = match_jets(&reference, &candidates, 0.3);
        assert_eq!(m[0].candidate, 1);
        assert!(match_jets(&reference, &candidates[2..], 0.3).is_empty());
    }

    #[test]
    fn test_phi_wraps() {
        let reference = [jet(40.0, 0.0, 3.1)];
        let candidates = [jet(40.0, 0.0, -3.1)];
        assert_eq!(match_jets(&reference, &candidates, 0.3).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_each_jet_used_once(
            refs in prop::collection::vec((5.0f64..100.0, -2.0f64..2.0, -3.0f64..3.0), 0..12),
            cands in prop::collection::vec((5.0f64..100.0, -2.0f64..2.0, -3.0f64..3.0), 0..12),
        ) {
            let r: Vec<_> = refs.iter().map(|&(pt, eta, phi)| jet(pt, eta, phi)).collect();
            let c: Vec<_> = cands.iter().map(|&(pt, eta, phi)| jet(pt, eta, phi)).collect();
            let m = match_jets(&r, &c, 0.4);
            let mut seen_r = vec![false; r.len()];
            let mut seen_c = vec![false; c.len()];
            for x in &m {
                prop_assert!(!seen_r[x.reference]);
                prop_assert!(!seen_c[x.candidate]);
                prop_assert!(x.delta_r < 0.4);
                seen_r[x.reference] = true;
                seen_c[x.candidate] = true;
            }
        }
    }
}
