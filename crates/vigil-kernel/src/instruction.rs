//! Agent instructions
//!
//! Collaborators submit instructions either as typed values or in the wire
//! form:
//!
//! ```json
//! {"id": "cycle-7", "operation": "COMPUTE", "writer": "router",
//!  "parameters": {"kind": "violation_pressure", "traits": {"modularity": 0.28}}}
//! ```
//!
//! Parsing only checks shape. Trait values are validated when the
//! instruction executes, so a bad payload is reported as a failed
//! instruction rather than a parse error.

use crate::arbitration::Candidate;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;
use vigil_core::{Error, Identity, Result, WriterId};

#[derive(Debug, Clone, PartialEq)]
pub struct AgentInstruction {
    pub id: String,
    pub operation: Operation,
    /// Recorded on cells this instruction writes; the engine default otherwise.
    pub writer: Option<WriterId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Read { position: u64 },
    Write { traits: BTreeMap<String, f64> },
    Compute(ComputeRequest),
    Arbitrate { trait_name: String, candidates: Vec<Candidate> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComputeRequest {
    ViolationPressure {
        traits: BTreeMap<String, f64>,
        /// Identity the reading is about; the payload's anchor when absent.
        subject: Option<Identity>,
    },
    TraitConvergence {
        trait_name: String,
        a: ConvergenceSource,
        b: ConvergenceSource,
    },
    IdentityAnchor { traits: BTreeMap<String, f64> },
}

/// One operand of a convergence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceSource {
    pub value: f64,
    pub weight: f64,
    /// Where the value came from; checked against quarantine.
    pub identity: Option<Identity>,
}

impl ConvergenceSource {
    pub fn new(value: f64, weight: f64) -> Self {
        Self {
            value,
            weight,
            identity: None,
        }
    }

    pub fn from_identity(identity: Identity, value: f64, weight: f64) -> Self {
        Self {
            value,
            weight,
            identity: Some(identity),
        }
    }
}

impl Operation {
    /// Name used in logs and failure events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Read { .. } => "READ",
            Self::Write { .. } => "WRITE",
            Self::Compute(ComputeRequest::ViolationPressure { .. }) => "COMPUTE:violation_pressure",
            Self::Compute(ComputeRequest::TraitConvergence { .. }) => "COMPUTE:trait_convergence",
            Self::Compute(ComputeRequest::IdentityAnchor { .. }) => "COMPUTE:identity_anchor",
            Self::Arbitrate { .. } => "ARBITRATE",
        }
    }

    /// Whether a successful run appends a cell.
    pub fn persists(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Compute(_))
    }

    /// The trait this operation is about, when it names one.
    pub fn trait_name(&self) -> Option<&str> {
        match self {
            Self::Compute(ComputeRequest::TraitConvergence { trait_name, .. }) | Self::Arbitrate { trait_name, .. } => {
                Some(trait_name)
            }
            _ => None,
        }
    }
}

impl AgentInstruction {
    /// Instruction with a fresh random id.
    pub fn new(operation: Operation) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            writer: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_writer(mut self, writer: impl Into<WriterId>) -> Self {
        self.writer = Some(writer.into());
        self
    }

    pub fn read(position: u64) -> Self {
        Self::new(Operation::Read { position })
    }

    pub fn write(traits: BTreeMap<String, f64>) -> Self {
        Self::new(Operation::Write { traits })
    }

    pub fn compute(request: ComputeRequest) -> Self {
        Self::new(Operation::Compute(request))
    }

    /// Parse the wire form. Operation names are case-insensitive.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::invalid_payload("instruction must be a JSON object"))?;
        let operation_name = object
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_payload("instruction has no 'operation'"))?;
        let empty = Value::Object(Default::default());
        let params = object.get("parameters").unwrap_or(&empty);

        let operation = match operation_name.to_ascii_lowercase().as_str() {
            "read" => Operation::Read {
                position: params
                    .get("position")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::invalid_payload("READ needs a non-negative integer 'position'"))?,
            },
            "write" => Operation::Write {
                traits: parse_traits(params)?,
            },
            "compute" => Operation::Compute(parse_compute(params)?),
            "arbitrate" => Operation::Arbitrate {
                trait_name: required_str(params, "trait_name")?,
                candidates: parse_candidates(params)?,
            },
            _ => return Err(Error::unsupported(operation_name)),
        };

        let mut instruction = Self::new(operation);
        if let Some(id) = object.get("id").and_then(Value::as_str) {
            instruction.id = id.to_string();
        }
        instruction.writer = object.get("writer").and_then(Value::as_str).map(WriterId::from);
        Ok(instruction)
    }
}

fn parse_compute(params: &Value) -> Result<ComputeRequest> {
    let kind = params
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_payload("COMPUTE needs a 'kind'"))?;
    match kind {
        "violation_pressure" => Ok(ComputeRequest::ViolationPressure {
            traits: parse_traits(params)?,
            subject: optional_identity(params, "subject")?,
        }),
        "trait_convergence" => Ok(ComputeRequest::TraitConvergence {
            trait_name: required_str(params, "trait_name")?,
            a: ConvergenceSource {
                value: required_f64(params, "value_a")?,
                weight: required_f64(params, "weight_a")?,
                identity: optional_identity(params, "identity_a")?,
            },
            b: ConvergenceSource {
                value: required_f64(params, "value_b")?,
                weight: required_f64(params, "weight_b")?,
                identity: optional_identity(params, "identity_b")?,
            },
        }),
        "identity_anchor" => Ok(ComputeRequest::IdentityAnchor {
            traits: parse_traits(params)?,
        }),
        other => Err(Error::unsupported(format!("COMPUTE:{other}"))),
    }
}

/// `traits` as a name -> number map. A missing map is an empty payload.
fn parse_traits(params: &Value) -> Result<BTreeMap<String, f64>> {
    let Some(traits) = params.get("traits") else {
        return Ok(BTreeMap::new());
    };
    let object = traits
        .as_object()
        .ok_or_else(|| Error::invalid_payload("'traits' must be an object"))?;
    object
        .iter()
        .map(|(name, value)| {
            value
                .as_f64()
                .map(|v| (name.clone(), v))
                .ok_or_else(|| Error::invalid_trait(name, format!("value {value} is not a number")))
        })
        .collect()
}

fn parse_candidates(params: &Value) -> Result<Vec<Candidate>> {
    let list = params
        .get("candidates")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::invalid_payload("ARBITRATE needs a 'candidates' array"))?;
    list.iter()
        .map(|c| {
            let identity = optional_identity(c, "identity")?
                .ok_or_else(|| Error::invalid_payload("candidate has no 'identity'"))?;
            Ok(Candidate {
                identity,
                value: required_f64(c, "value")?,
                weight: required_f64(c, "weight")?,
            })
        })
        .collect()
}

fn required_str(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_payload(format!("missing string '{key}'")))
}

fn required_f64(params: &Value, key: &str) -> Result<f64> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::invalid_payload(format!("missing number '{key}'")))
}

fn optional_identity(params: &Value, key: &str) -> Result<Option<Identity>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Identity::parse(s)
            .map(Some)
            .ok_or_else(|| Error::invalid_payload(format!("'{key}' is not an identity: {s}"))),
        Some(other) => Err(Error::invalid_payload(format!("'{key}' is not an identity: {other}"))),
    }
}
