//! Trait convergence: weighted blending of two values for one trait,
//! clamped into the trait's envelope when one exists.
//!
//! The same recurrence covers inheriting from two parents and pulling a
//! value toward stability; the caller picks the second operand.

use crate::monitor::VpReading;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vigil_core::{EnvelopeRegistry, Error, Result, VpClass};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Converged {
    pub value: f64,
    /// The blended value fell outside the envelope and was clamped.
    pub clamped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Stable,
    Converging,
    Diverging,
}

/// Derived from a fresh reading every time; never cached.
pub fn status(reading: &VpReading) -> ConvergenceStatus {
    match reading.classification {
        VpClass::Vp0 => ConvergenceStatus::Stable,
        VpClass::Vp1 | VpClass::Vp2 => ConvergenceStatus::Converging,
        VpClass::Vp3 | VpClass::Vp4 => ConvergenceStatus::Diverging,
    }
}

pub struct TraitConvergenceEngine {
    registry: Arc<EnvelopeRegistry>,
}

impl TraitConvergenceEngine {
    pub fn new(registry: Arc<EnvelopeRegistry>) -> Self {
        Self { registry }
    }

    /// `(wa*a + wb*b) / (wa + wb)`, clamped to `[center - radius, center + radius]`
    /// when the trait has an envelope.
    pub fn converge(&self, trait_name: &str, value_a: f64, weight_a: f64, value_b: f64, weight_b: f64) -> Result<f64> {
        self.converge_detailed(trait_name, value_a, weight_a, value_b, weight_b)
            .map(|c| c.value)
    }

    pub fn converge_detailed(
        &self,
        trait_name: &str,
        value_a: f64,
        weight_a: f64,
        value_b: f64,
        weight_b: f64,
    ) -> Result<Converged> {
        for value in [value_a, value_b] {
            if !value.is_finite() {
                return Err(Error::invalid_trait(
                    trait_name,
                    format!("convergence input {} is not finite", value),
                ));
            }
        }
        let total = weight_a + weight_b;
        if !weight_a.is_finite() || !weight_b.is_finite() || !total.is_finite() || total <= 0.0 {
            return Err(Error::DivergentWeights {
                trait_name: trait_name.to_string(),
                weight_a,
                weight_b,
            });
        }

        let blended = (weight_a * value_a + weight_b * value_b) / total;
        if !blended.is_finite() {
            return Err(Error::invalid_trait(trait_name, "weighted blend overflowed"));
        }

        Ok(match self.registry.get(trait_name) {
            Some(envelope) => {
                let value = envelope.clamp(blended);
                Converged {
                    value,
                    clamped: value != blended,
                }
            }
            None => Converged {
                value: blended,
                clamped: false,
            },
        })
    }

    /// Pull `value` toward the envelope center with `pull` weight.
    pub fn stabilize(&self, trait_name: &str, value: f64, weight: f64, pull: f64) -> Result<f64> {
        let envelope = self.registry.get(trait_name).ok_or_else(|| {
            Error::invalid_trait(trait_name, "no stability envelope to pull toward")
        })?;
        self.converge(trait_name, value, weight, envelope.center, pull)
    }
}
