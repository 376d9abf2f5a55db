//! Events carried by the coordination bus
//!
//! Every event has an id, a timestamp, a publisher and a priority. The
//! priority is informational: delivery order is publish order per publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;
use vigil_core::{Identity, VpClass};

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    /// Decisions that drive coordination
    High = 2,
    /// Quarantine entry, phase transitions
    Critical = 3,
}

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Discriminant of [`EventPayload`], used for subscription filters.
///
/// Decisions get one kind per detail category so a subscriber can ask for
/// network decisions alone; `DecisionMade` covers the general category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ViolationPressure,
    Quarantine,
    InstructionFailed,
    CellWritten,
    NetworkDecision,
    EvolutionDecision,
    PhaseTransition,
    DecisionMade,
    Consolidation,
}

impl EventKind {
    /// Every decision category.
    pub const DECISIONS: [EventKind; 4] = [
        EventKind::NetworkDecision,
        EventKind::EvolutionDecision,
        EventKind::PhaseTransition,
        EventKind::DecisionMade,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViolationPressure => "violation_pressure",
            Self::Quarantine => "quarantine",
            Self::InstructionFailed => "instruction_failed",
            Self::CellWritten => "cell_written",
            Self::NetworkDecision => "network_decision",
            Self::EvolutionDecision => "evolution_decision",
            Self::PhaseTransition => "phase_transition",
            Self::DecisionMade => "decision_made",
            Self::Consolidation => "consolidation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineAction {
    Quarantined,
    Released,
}

/// Typed event content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A violation pressure computation finished.
    ViolationPressure {
        subject: Identity,
        vp: f64,
        raw_total: f64,
        classification: VpClass,
        breakdown: BTreeMap<String, f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_ref: Option<String>,
    },

    /// An identity entered or left quarantine.
    Quarantine {
        identity: Identity,
        action: QuarantineAction,
        vp: f64,
        reason: String,
    },

    /// An instruction failed; carries enough context to diagnose it.
    InstructionFailed {
        instruction_id: String,
        operation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<Identity>,
        error_kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trait_name: Option<String>,
    },

    /// A result was persisted to the tape.
    CellWritten {
        position: u64,
        writer: String,
        kind: String,
    },

    /// A collaborator made a routing decision.
    Decision(Decision),

    /// The collaborator's domain metric and the kernel's VP both indicate a
    /// consolidated state. The two thresholds are reported separately.
    Consolidation {
        domain_metric: String,
        domain_value: f64,
        domain_threshold: f64,
        vp: f64,
        vp_boundary: f64,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ViolationPressure { .. } => EventKind::ViolationPressure,
            Self::Quarantine { .. } => EventKind::Quarantine,
            Self::InstructionFailed { .. } => EventKind::InstructionFailed,
            Self::CellWritten { .. } => EventKind::CellWritten,
            Self::Decision(decision) => decision.detail.kind(),
            Self::Consolidation { .. } => EventKind::Consolidation,
        }
    }

    /// Priority an event of this content gets unless the publisher overrides it.
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Quarantine {
                action: QuarantineAction::Quarantined,
                ..
            } => Priority::Critical,
            Self::ViolationPressure { classification, .. } if classification.is_critical() => {
                Priority::High
            }
            Self::InstructionFailed { .. } => Priority::High,
            Self::Decision(decision) => decision.detail.priority(),
            Self::CellWritten { .. } => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// A decision made by a routing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_type: String,
    pub chosen_option: String,
    #[serde(default)]
    pub available_options: Vec<String>,
    /// e.g. "unified_consensus", "explorer_driven"
    #[serde(default)]
    pub decision_mode: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub response_time_ms: f64,
    pub detail: DecisionDetail,
}

fn default_confidence() -> f64 {
    1.0
}

/// Type-specific decision context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detail", rename_all = "snake_case")]
pub enum DecisionDetail {
    Network {
        org_a_id: Option<String>,
        org_b_id: Option<String>,
        network_metrics: BTreeMap<String, f64>,
        connection_details: Value,
    },
    Evolution {
        organism_id: Option<String>,
        mutation_type: Option<String>,
        trait_changes: Value,
        fitness_before: f64,
        fitness_after: f64,
    },
    PhaseTransition {
        current_phase: String,
        target_phase: String,
        transition_criteria: BTreeMap<String, bool>,
        system_state: Value,
    },
    General,
}

impl DecisionDetail {
    /// Pick the detail variant for `decision_type`, reading its fields from
    /// `extra`. Missing fields take empty defaults.
    pub fn for_type(decision_type: &str, extra: &Value) -> Self {
        let text = |key: &str| extra.get(key).and_then(Value::as_str).map(str::to_string);
        let number = |key: &str| extra.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        let object = |key: &str| extra.get(key).cloned().unwrap_or_else(|| Value::Object(Default::default()));

        match decision_type {
            "network_connection" | "resource_allocation" | "organism_selection" => Self::Network {
                org_a_id: text("org_a_id"),
                org_b_id: text("org_b_id"),
                network_metrics: extra
                    .get("network_metrics")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default(),
                connection_details: object("connection_details"),
            },
            "evolution_mutation" | "trait_translation" => Self::Evolution {
                organism_id: text("organism_id"),
                mutation_type: text("mutation_type"),
                trait_changes: object("trait_changes"),
                fitness_before: number("fitness_before"),
                fitness_after: number("fitness_after"),
            },
            "phase_transition" => Self::PhaseTransition {
                current_phase: text("current_phase").unwrap_or_default(),
                target_phase: text("target_phase").unwrap_or_default(),
                transition_criteria: extra
                    .get("transition_criteria")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default(),
                system_state: object("system_state"),
            },
            _ => Self::General,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Network { .. } => EventKind::NetworkDecision,
            Self::Evolution { .. } => EventKind::EvolutionDecision,
            Self::PhaseTransition { .. } => EventKind::PhaseTransition,
            Self::General => EventKind::DecisionMade,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Self::PhaseTransition { .. } => Priority::Critical,
            _ => Priority::High,
        }
    }
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    /// Component that published the event (e.g. "vp-monitor").
    pub publisher: String,
}

impl Event {
    pub fn new(publisher: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority: payload.default_priority(),
            payload,
            timestamp: Utc::now(),
            publisher: publisher.into(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Build a decision event, choosing the detail variant (and with it the
    /// priority) from `decision_type`.
    #[allow(clippy::too_many_arguments)]
    pub fn decision(
        publisher: impl Into<String>,
        decision_type: impl Into<String>,
        chosen_option: impl Into<String>,
        available_options: Vec<String>,
        decision_mode: impl Into<String>,
        context: Value,
        response_time_ms: f64,
        extra: &Value,
    ) -> Self {
        let decision_type = decision_type.into();
        let detail = DecisionDetail::for_type(&decision_type, extra);
        let confidence = extra
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or_else(default_confidence);
        Self::new(
            publisher,
            EventPayload::Decision(Decision {
                decision_type,
                chosen_option: chosen_option.into(),
                available_options,
                decision_mode: decision_mode.into(),
                context,
                confidence,
                response_time_ms,
                detail,
            }),
        )
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Which events a subscriber receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventFilter {
    #[default]
    All,
    Kinds(Vec<EventKind>),
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(&event.kind()),
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        Self::Kinds(vec![kind])
    }
}

impl From<Vec<EventKind>> for EventFilter {
    fn from(kinds: Vec<EventKind>) -> Self {
        Self::Kinds(kinds)
    }
}
