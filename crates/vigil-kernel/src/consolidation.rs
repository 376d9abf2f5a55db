//! Consolidation detection
//!
//! A collaborator reports its own domain metric (for example network
//! modularity) alongside the kernel's VP. Consolidation holds when the metric
//! is strictly below the collaborator's threshold *and* VP is below the VP1
//! boundary. The two thresholds are different quantities and are reported
//! as separate fields.

use crate::monitor::VpReading;
use serde::{Deserialize, Serialize};
use tracing::info;
use vigil_bus::{Event, EventBus, EventPayload};
use vigil_core::{ConsolidationSection, VP1_BOUNDARY};

pub const PUBLISHER: &str = "consolidation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consolidation {
    pub domain_metric: String,
    pub domain_value: f64,
    pub domain_threshold: f64,
    pub vp: f64,
    pub vp_boundary: f64,
}

pub struct ConsolidationDetector {
    domain_metric: String,
    domain_threshold: f64,
    bus: Option<EventBus>,
}

impl ConsolidationDetector {
    pub fn new(section: &ConsolidationSection, bus: Option<EventBus>) -> Self {
        Self {
            domain_metric: section.domain_metric.clone(),
            domain_threshold: section.domain_threshold,
            bus,
        }
    }

    /// Check one observation; publishes and returns the consolidation if it holds.
    pub fn evaluate(&self, domain_value: f64, reading: &VpReading) -> Option<Consolidation> {
        if !domain_value.is_finite() || domain_value >= self.domain_threshold || reading.vp >= VP1_BOUNDARY {
            return None;
        }
        let consolidation = Consolidation {
            domain_metric: self.domain_metric.clone(),
            domain_value,
            domain_threshold: self.domain_threshold,
            vp: reading.vp,
            vp_boundary: VP1_BOUNDARY,
        };
        info!(
            "Consolidation: {} {:.4} < {:.4} with VP {:.4} < {:.2}",
            consolidation.domain_metric,
            domain_value,
            self.domain_threshold,
            reading.vp,
            VP1_BOUNDARY
        );
        if let Some(bus) = &self.bus {
            bus.publish(Event::new(
                PUBLISHER,
                EventPayload::Consolidation {
                    domain_metric: consolidation.domain_metric.clone(),
                    domain_value,
                    domain_threshold: self.domain_threshold,
                    vp: reading.vp,
                    vp_boundary: VP1_BOUNDARY,
                },
            ));
        }
        Some(consolidation)
    }
}
