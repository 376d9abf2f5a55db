//! Temporal isolation
//!
//! An identity whose VP reaches the VP3 boundary is quarantined: its values
//! must not feed convergence. It is released only once a later reading drops
//! below the VP2 boundary, so readings in between leave the state as it is.
//! Nothing here ever touches the tape.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use vigil_bus::{Event, EventBus, EventHandler, EventKind, EventPayload, QuarantineAction, SubscriptionHandle};
use vigil_core::{Identity, VP2_BOUNDARY, VP3_BOUNDARY};

use crate::monitor;

pub const PUBLISHER: &str = "temporal-isolation";

/// VP at or above which an identity is quarantined.
pub const ENTER_THRESHOLD: f64 = VP3_BOUNDARY;
/// VP strictly below which a quarantined identity is released.
pub const RELEASE_THRESHOLD: f64 = VP2_BOUNDARY;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub identity: Identity,
    pub entered_at: DateTime<Utc>,
    pub entry_vp: f64,
    pub last_vp: f64,
    /// Operation that produced the triggering reading, if known.
    pub operation_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuarantineTransition {
    Entered(QuarantineRecord),
    Released { identity: Identity, vp: f64 },
}

pub struct TemporalIsolationManager {
    records: DashMap<Identity, QuarantineRecord>,
    bus: Option<EventBus>,
    released: AtomicU64,
}

impl TemporalIsolationManager {
    pub fn new(bus: Option<EventBus>) -> Self {
        Self {
            records: DashMap::new(),
            bus,
            released: AtomicU64::new(0),
        }
    }

    /// Subscribe this manager to VP events on `bus`.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriptionHandle {
        bus.subscribe(EventKind::ViolationPressure, self.clone())
    }

    /// Apply one VP reading for `identity`. Returns the transition, if any.
    pub fn observe(&self, identity: Identity, vp: f64, operation_ref: Option<&str>) -> Option<QuarantineTransition> {
        // NaN counts as maximal pressure, matching classification.
        let vp_for_entry = if vp.is_nan() { f64::INFINITY } else { vp };

        if let Some(mut record) = self.records.get_mut(&identity) {
            record.last_vp = vp;
            if vp_for_entry >= RELEASE_THRESHOLD {
                return None;
            }
        } else {
            if vp_for_entry < ENTER_THRESHOLD {
                return None;
            }
            let record = QuarantineRecord {
                identity,
                entered_at: Utc::now(),
                entry_vp: vp,
                last_vp: vp,
                operation_ref: operation_ref.map(str::to_string),
            };
            // Another observer may have inserted first; only one entry wins.
            let mut inserted = false;
            self.records.entry(identity).or_insert_with(|| {
                inserted = true;
                record.clone()
            });
            if !inserted {
                return None;
            }
            warn!("Identity {} quarantined at VP {:.4}", identity, vp);
            self.publish(identity, QuarantineAction::Quarantined, vp, format!("VP {:.4} >= {}", vp, ENTER_THRESHOLD));
            return Some(QuarantineTransition::Entered(record));
        }

        // Below the release threshold while quarantined.
        if self.records.remove(&identity).is_none() {
            return None;
        }
        self.released.fetch_add(1, Ordering::Relaxed);
        info!("Identity {} released from quarantine at VP {:.4}", identity, vp);
        self.publish(identity, QuarantineAction::Released, vp, format!("VP {:.4} < {}", vp, RELEASE_THRESHOLD));
        Some(QuarantineTransition::Released { identity, vp })
    }

    pub fn is_quarantined(&self, identity: &Identity) -> bool {
        self.records.contains_key(identity)
    }

    pub fn record(&self, identity: &Identity) -> Option<QuarantineRecord> {
        self.records.get(identity).map(|r| r.clone())
    }

    /// Currently quarantined records, ordered by identity.
    pub fn active(&self) -> Vec<QuarantineRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.identity);
        records
    }

    pub fn active_count(&self) -> usize {
        self.records.len()
    }

    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    fn publish(&self, identity: Identity, action: QuarantineAction, vp: f64, reason: String) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::new(
                PUBLISHER,
                EventPayload::Quarantine {
                    identity,
                    action,
                    vp,
                    reason,
                },
            ));
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for TemporalIsolationManager {
    fn name(&self) -> &str {
        PUBLISHER
    }

    async fn handle(&self, event: &Event) {
        // The engine feeds its own readings in directly, after persisting
        // them; a late bus copy would replay a stale VP.
        if event.publisher == monitor::PUBLISHER {
            return;
        }
        if let EventPayload::ViolationPressure {
            subject,
            vp,
            operation_ref,
            ..
        } = &event.payload
        {
            self.observe(*subject, *vp, operation_ref.as_deref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::anchor_traits;

    fn id(n: f64) -> Identity {
        anchor_traits(&[("n".to_string(), n)].into_iter().collect()).unwrap()
    }

    #[test]
    fn hysteresis_holds_between_thresholds() {
        let manager = TemporalIsolationManager::new(None);
        let who = id(1.0);
        assert!(matches!(manager.observe(who, 0.80, None), Some(QuarantineTransition::Entered(_))));
        assert!(manager.observe(who, 0.60, None).is_none());
        assert!(manager.is_quarantined(&who));
        assert!(matches!(manager.observe(who, 0.40, None), Some(QuarantineTransition::Released { .. })));
        assert!(!manager.is_quarantined(&who));
        assert_eq!(manager.released_count(), 1);
    }

    #[test]
    fn mid_range_never_enters() {
        let manager = TemporalIsolationManager::new(None);
        assert!(manager.observe(id(2.0), 0.6, None).is_none());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn entry_boundary_is_inclusive() {
        let manager = TemporalIsolationManager::new(None);
        let who = id(3.0);
        assert!(manager.observe(who, ENTER_THRESHOLD, Some("op-1")).is_some());
        assert_eq!(manager.record(&who).unwrap().operation_ref.as_deref(), Some("op-1"));
        // exactly at the release threshold stays quarantined
        assert!(manager.observe(who, RELEASE_THRESHOLD, None).is_none());
        assert!(manager.is_quarantined(&who));
    }
}
