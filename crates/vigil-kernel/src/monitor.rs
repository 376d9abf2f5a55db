//! Violation pressure monitor
//!
//! VP measures how far a payload sits from its stability envelopes: each
//! monitored trait contributes `|actual - center| / (radius * compression)`,
//! contributions are summed in trait-name order, and the sum saturates at
//! 1.0. Traits without an envelope contribute nothing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use vigil_bus::{Event, EventBus, EventPayload};
use vigil_core::{anchor, classify, EnvelopeRegistry, Identity, Payload, VpClass};

pub const PUBLISHER: &str = "vp-monitor";

/// One VP computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpReading {
    /// Saturated pressure in `[0, 1]`.
    pub vp: f64,
    /// Sum before saturation.
    pub raw_total: f64,
    pub classification: VpClass,
    /// Contribution of each monitored trait.
    pub breakdown: BTreeMap<String, f64>,
    pub monitored_traits: usize,
}

impl VpReading {
    fn vacuous() -> Self {
        Self {
            vp: 0.0,
            raw_total: 0.0,
            classification: VpClass::Vp0,
            breakdown: BTreeMap::new(),
            monitored_traits: 0,
        }
    }
}

pub struct ViolationPressureMonitor {
    registry: Arc<EnvelopeRegistry>,
    bus: Option<EventBus>,
    calculations: AtomicU64,
    last: Mutex<Option<VpReading>>,
}

impl ViolationPressureMonitor {
    pub fn new(registry: Arc<EnvelopeRegistry>, bus: Option<EventBus>) -> Self {
        Self {
            registry,
            bus,
            calculations: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<EnvelopeRegistry> {
        &self.registry
    }

    /// Compute VP for `payload` and publish it with the payload's own
    /// anchor as subject.
    pub fn compute_violation_pressure(&self, payload: &Payload) -> VpReading {
        self.assess(anchor(payload), payload, None)
    }

    /// Compute VP for `payload` on behalf of `subject` and publish it.
    pub fn assess(&self, subject: Identity, payload: &Payload, operation_ref: Option<&str>) -> VpReading {
        let reading = self.measure(payload);
        self.record(subject, &reading, operation_ref);
        reading
    }

    /// Count a reading taken with `measure`, remember it, and publish it.
    /// Callers that persist readings call this only once the write landed.
    pub fn record(&self, subject: Identity, reading: &VpReading, operation_ref: Option<&str>) {
        self.calculations.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(reading.clone());
        }
        debug!(
            "VP for {}: {:.4} ({}, {} monitored traits)",
            subject, reading.vp, reading.classification, reading.monitored_traits
        );

        if let Some(bus) = &self.bus {
            bus.publish(Event::new(
                PUBLISHER,
                EventPayload::ViolationPressure {
                    subject,
                    vp: reading.vp,
                    raw_total: reading.raw_total,
                    classification: reading.classification,
                    breakdown: reading.breakdown.clone(),
                    operation_ref: operation_ref.map(str::to_string),
                },
            ));
        }
    }

    /// Pure computation against one registry snapshot; no events, no counters.
    pub fn measure(&self, payload: &Payload) -> VpReading {
        let envelopes = self.registry.snapshot();
        let mut breakdown = BTreeMap::new();
        let mut sum = NeumaierSum::default();

        for (name, actual) in payload.iter() {
            let Some(envelope) = envelopes.get(name) else {
                continue;
            };
            let contribution = finite_or_max(envelope.contribution(actual));
            sum.add(contribution);
            breakdown.insert(name.to_string(), contribution);
        }

        if breakdown.is_empty() {
            return VpReading::vacuous();
        }

        let raw_total = finite_or_max(sum.total());
        let vp = raw_total.clamp(0.0, 1.0);
        VpReading {
            vp,
            raw_total,
            classification: classify(vp),
            monitored_traits: breakdown.len(),
            breakdown,
        }
    }

    /// Number of readings taken through `assess`.
    pub fn calculations(&self) -> u64 {
        self.calculations.load(Ordering::Relaxed)
    }

    pub fn last_reading(&self) -> Option<VpReading> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

/// Keep JSON-representable: an overflowing contribution becomes `f64::MAX`.
fn finite_or_max(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        f64::MAX
    }
}

/// Compensated summation.
#[derive(Default)]
struct NeumaierSum {
    sum: f64,
    compensation: f64,
}

impl NeumaierSum {
    fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    fn total(&self) -> f64 {
        self.sum + self.compensation
    }
}
