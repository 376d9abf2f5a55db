//! Stability envelopes and the copy-on-write registry that holds them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Target center and tolerance band for one trait.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StabilityEnvelope {
    pub trait_name: String,
    pub center: f64,
    pub radius: f64,
    pub compression: f64,
}

impl StabilityEnvelope {
    pub fn new(trait_name: impl Into<String>, center: f64, radius: f64, compression: f64) -> Result<Self> {
        let envelope = Self {
            trait_name: trait_name.into(),
            center,
            radius,
            compression,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<()> {
        if self.trait_name.is_empty() {
            return Err(Error::invalid_envelope("", "trait name is empty"));
        }
        if !self.center.is_finite() {
            return Err(Error::invalid_envelope(
                &self.trait_name,
                format!("center must be finite, got {}", self.center),
            ));
        }
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err(Error::invalid_envelope(
                &self.trait_name,
                format!("radius must be > 0, got {}", self.radius),
            ));
        }
        if !self.compression.is_finite() || self.compression <= 0.0 {
            return Err(Error::invalid_envelope(
                &self.trait_name,
                format!("compression must be > 0, got {}", self.compression),
            ));
        }
        Ok(())
    }

    pub fn lower(&self) -> f64 {
        self.center - self.radius
    }

    pub fn upper(&self) -> f64 {
        self.center + self.radius
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lower(), self.upper())
    }

    /// `|actual - center| / (radius * compression)`, divided in two steps so
    /// a tiny radius and compression cannot underflow the denominator to 0.
    /// A value exactly at the center always contributes 0.
    pub fn contribution(&self, actual: f64) -> f64 {
        let deviation = (actual - self.center).abs();
        if deviation == 0.0 {
            return 0.0;
        }
        deviation / self.radius / self.compression
    }
}

/// Immutable view of every configured envelope at one instant.
pub type EnvelopeSnapshot = Arc<BTreeMap<String, StabilityEnvelope>>;

/// Multi-reader / single-writer envelope table.
///
/// Writers build a new map and swap the `Arc`; readers clone the current
/// `Arc` and work on it, so a reader never observes a half-applied update.
#[derive(Debug, Default)]
pub struct EnvelopeRegistry {
    current: RwLock<EnvelopeSnapshot>,
}

impl EnvelopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_envelopes(envelopes: impl IntoIterator<Item = StabilityEnvelope>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for envelope in envelopes {
            envelope.validate()?;
            map.insert(envelope.trait_name.clone(), envelope);
        }
        Ok(Self {
            current: RwLock::new(Arc::new(map)),
        })
    }

    pub fn snapshot(&self) -> EnvelopeSnapshot {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get(&self, trait_name: &str) -> Option<StabilityEnvelope> {
        self.snapshot().get(trait_name).cloned()
    }

    /// Replace (or add) the envelope for `trait_name`.
    pub fn set(&self, trait_name: &str, envelope: StabilityEnvelope) -> Result<()> {
        let envelope = StabilityEnvelope {
            trait_name: trait_name.to_string(),
            ..envelope
        };
        envelope.validate()?;
        self.replace(|map| {
            map.insert(trait_name.to_string(), envelope);
        });
        tracing::debug!("Envelope for '{}' replaced", trait_name);
        Ok(())
    }

    pub fn remove(&self, trait_name: &str) -> Option<StabilityEnvelope> {
        let mut removed = None;
        self.replace(|map| removed = map.remove(trait_name));
        removed
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn trait_names(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    fn replace(&self, edit: impl FnOnce(&mut BTreeMap<String, StabilityEnvelope>)) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = (**guard).clone();
        edit(&mut next);
        *guard = Arc::new(next);
    }
}
