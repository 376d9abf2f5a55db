//! Deterministic resolution of competing values for one trait.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use vigil_core::{Error, Identity, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub identity: Identity,
    pub value: f64,
    pub weight: f64,
}

/// Highest weight wins; equal weights go to the smaller identity.
///
/// The outcome does not depend on candidate order.
pub fn arbitrate(trait_name: &str, candidates: &[Candidate]) -> Result<Candidate> {
    if candidates.is_empty() {
        return Err(Error::invalid_trait(trait_name, "no candidates to arbitrate"));
    }
    for candidate in candidates {
        if !candidate.value.is_finite() || !candidate.weight.is_finite() {
            return Err(Error::invalid_trait(
                trait_name,
                format!(
                    "candidate {} has non-finite value {} or weight {}",
                    candidate.identity, candidate.value, candidate.weight
                ),
            ));
        }
    }

    let winner = candidates
        .iter()
        .copied()
        .min_by(|a, b| match unsigned_zero(b.weight).total_cmp(&unsigned_zero(a.weight)) {
            Ordering::Equal => a.identity.cmp(&b.identity),
            other => other,
        });
    winner.ok_or_else(|| Error::invalid_trait(trait_name, "no candidates to arbitrate"))
}

/// `total_cmp` orders -0.0 below 0.0; equal weights must tie.
fn unsigned_zero(weight: f64) -> f64 {
    if weight == 0.0 {
        0.0
    } else {
        weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::anchor_traits;

    fn candidate(seed: f64, value: f64, weight: f64) -> Candidate {
        Candidate {
            identity: anchor_traits(&[("seed".to_string(), seed)].into_iter().collect()).unwrap(),
            value,
            weight,
        }
    }

    #[test]
    fn heaviest_wins() {
        let cs = [candidate(1.0, 0.1, 1.0), candidate(2.0, 0.9, 3.0)];
        assert_eq!(arbitrate("x", &cs).unwrap().value, 0.9);
    }

    #[test]
    fn ties_resolve_the_same_in_any_order() {
        let a = candidate(1.0, 0.1, 2.0);
        let b = candidate(2.0, 0.9, 2.0);
        let expected = if a.identity < b.identity { a } else { b };
        assert_eq!(arbitrate("x", &[a, b]).unwrap(), expected);
        assert_eq!(arbitrate("x", &[b, a]).unwrap(), expected);
    }

    #[test]
    fn signed_zero_weights_tie() {
        let a = candidate(1.0, 0.1, -0.0);
        let b = candidate(2.0, 0.9, 0.0);
        let expected = if a.identity < b.identity { a } else { b };
        assert_eq!(arbitrate("x", &[a, b]).unwrap().identity, expected.identity);
        assert_eq!(arbitrate("x", &[b, a]).unwrap().identity, expected.identity);
    }

    #[test]
    fn rejects_empty_and_non_finite() {
        assert!(arbitrate("x", &[]).is_err());
        assert!(arbitrate("x", &[candidate(1.0, f64::NAN, 1.0)]).is_err());
    }
}
