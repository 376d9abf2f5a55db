//! Content stored in tape cells.
//!
//! Every WRITE or COMPUTE result and every envelope change becomes exactly
//! one cell. The enum is internally tagged so the on-disk JSON carries a
//! `"kind"` discriminator that replay can dispatch on.

use crate::classification::VpClass;
use crate::envelope::StabilityEnvelope;
use crate::identity::Identity;
use crate::types::Payload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CellContent {
    /// A canonicalized payload written by a WRITE instruction.
    Payload { identity: Identity, traits: Payload },

    /// Result of a violation pressure computation.
    ViolationPressure {
        subject: Identity,
        vp: f64,
        raw_total: f64,
        classification: VpClass,
        breakdown: BTreeMap<String, f64>,
    },

    /// Result of a trait convergence computation.
    Convergence {
        trait_name: String,
        value: f64,
        clamped: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        excluded_sources: Vec<Identity>,
    },

    /// Result of an identity anchor computation.
    Anchor { identity: Identity },

    /// An envelope replacement, recorded so the registry can be rebuilt.
    EnvelopeUpdate { envelope: StabilityEnvelope },
}

impl CellContent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Payload { .. } => "payload",
            Self::ViolationPressure { .. } => "violation_pressure",
            Self::Convergence { .. } => "convergence",
            Self::Anchor { .. } => "anchor",
            Self::EnvelopeUpdate { .. } => "envelope_update",
        }
    }

    /// The identity this cell is about, if any.
    pub fn identity(&self) -> Option<Identity> {
        match self {
            Self::Payload { identity, .. } | Self::Anchor { identity } => Some(*identity),
            Self::ViolationPressure { subject, .. } => Some(*subject),
            _ => None,
        }
    }
}
