//! Instruction execution engine
//!
//! Every instruction goes through the same lifecycle:
//!
//! ```text
//! Received -> Validated -> Dispatched -> Executed -> Persisted -> Returned
//! ```
//!
//! `Persisted` only applies to WRITE and COMPUTE. All computation happens
//! before the tape is touched, so a failing instruction never leaves a cell
//! behind. Every failure is published as an `InstructionFailed` event and
//! returned to the caller with its context.

use crate::arbitration::{arbitrate, Candidate};
use crate::convergence::TraitConvergenceEngine;
use crate::instruction::{AgentInstruction, ComputeRequest, ConvergenceSource, Operation};
use crate::monitor::{ViolationPressureMonitor, VpReading};
use crate::quarantine::TemporalIsolationManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};
use vigil_bus::{Event, EventBus, EventPayload};
use vigil_core::{anchor, CellContent, Error, Identity, Payload, WriterId};
use vigil_ledger::{TapeCell, TapeLedger};

pub const PUBLISHER: &str = "instruction-engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Validated,
    Dispatched,
    Executed,
    Persisted,
    Returned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstructionResult {
    Cell(TapeCell),
    Written {
        identity: Identity,
    },
    ViolationPressure {
        subject: Identity,
        reading: VpReading,
    },
    Convergence {
        trait_name: String,
        value: f64,
        clamped: bool,
        excluded_sources: Vec<Identity>,
    },
    Anchor {
        identity: Identity,
    },
    Arbitration {
        trait_name: String,
        winner: Candidate,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionOutcome {
    pub instruction_id: String,
    pub result: InstructionResult,
    /// Tape position of the persisted result, for WRITE and COMPUTE.
    pub position: Option<u64>,
    pub lifecycle: Vec<Stage>,
}

#[derive(Debug, thiserror::Error)]
#[error("instruction {instruction_id} ({operation}) failed: {source}")]
pub struct InstructionError {
    pub instruction_id: String,
    pub operation: String,
    pub identity: Option<Identity>,
    pub source: Error,
}

impl InstructionError {
    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }
}

pub struct InstructionEngine {
    ledger: Arc<TapeLedger>,
    monitor: Arc<ViolationPressureMonitor>,
    convergence: Arc<TraitConvergenceEngine>,
    quarantine: Arc<TemporalIsolationManager>,
    bus: Option<EventBus>,
    writer: WriterId,
}

/// Per-run state threaded through the lifecycle.
struct Run<'a> {
    instruction: &'a AgentInstruction,
    writer: WriterId,
    lifecycle: Vec<Stage>,
    identity: Option<Identity>,
}

impl Run<'_> {
    fn stage(&mut self, stage: Stage) {
        debug!("Instruction {} -> {:?}", self.instruction.id, stage);
        self.lifecycle.push(stage);
    }
}

impl InstructionEngine {
    pub fn new(
        ledger: Arc<TapeLedger>,
        monitor: Arc<ViolationPressureMonitor>,
        convergence: Arc<TraitConvergenceEngine>,
        quarantine: Arc<TemporalIsolationManager>,
        bus: Option<EventBus>,
        writer: WriterId,
    ) -> Self {
        Self {
            ledger,
            monitor,
            convergence,
            quarantine,
            bus,
            writer,
        }
    }

    /// Execute one instruction to completion.
    pub fn execute_instruction(&self, instruction: AgentInstruction) -> Result<InstructionOutcome, InstructionError> {
        let mut run = Run {
            writer: instruction.writer.clone().unwrap_or_else(|| self.writer.clone()),
            instruction: &instruction,
            lifecycle: Vec::with_capacity(6),
            identity: None,
        };
        run.stage(Stage::Received);

        match self.dispatch(&mut run) {
            Ok((result, position)) => {
                run.stage(Stage::Returned);
                Ok(InstructionOutcome {
                    instruction_id: instruction.id.clone(),
                    result,
                    position,
                    lifecycle: run.lifecycle,
                })
            }
            Err(source) => {
                let identity = run.identity;
                Err(self.fail(
                    instruction.id.clone(),
                    instruction.operation.label().to_string(),
                    identity,
                    instruction.operation.trait_name().map(str::to_string),
                    source,
                ))
            }
        }
    }

    /// Parse the wire form and execute it. Parse failures are reported
    /// like any other failed instruction.
    pub fn execute_json(&self, value: &Value) -> Result<InstructionOutcome, InstructionError> {
        match AgentInstruction::from_json(value) {
            Ok(instruction) => self.execute_instruction(instruction),
            Err(source) => {
                let id = value
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_default();
                let operation = value
                    .get("operation")
                    .and_then(Value::as_str)
                    .unwrap_or("<missing>")
                    .to_string();
                let trait_name = source.trait_name().map(str::to_string);
                Err(self.fail(id, operation, None, trait_name, source))
            }
        }
    }

    fn dispatch(&self, run: &mut Run<'_>) -> vigil_core::Result<(InstructionResult, Option<u64>)> {
        let instruction = run.instruction;
        match &instruction.operation {
            Operation::Read { position } => {
                run.stage(Stage::Validated);
                run.stage(Stage::Dispatched);
                let cell = self.ledger.read_cell(*position)?;
                run.identity = cell.content.identity();
                run.stage(Stage::Executed);
                Ok((InstructionResult::Cell(cell), None))
            }

            Operation::Write { traits } => {
                let payload = Payload::new(traits.clone())?;
                let identity = anchor(&payload);
                run.identity = Some(identity);
                run.stage(Stage::Validated);
                run.stage(Stage::Dispatched);
                run.stage(Stage::Executed);
                let position = self.persist(
                    run,
                    CellContent::Payload {
                        identity,
                        traits: payload,
                    },
                )?;
                Ok((InstructionResult::Written { identity }, Some(position)))
            }

            Operation::Compute(ComputeRequest::ViolationPressure { traits, subject }) => {
                let payload = Payload::new(traits.clone())?;
                let subject = subject.unwrap_or_else(|| anchor(&payload));
                run.identity = Some(subject);
                run.stage(Stage::Validated);
                run.stage(Stage::Dispatched);

                let reading = self.monitor.measure(&payload);
                run.stage(Stage::Executed);

                let position = self.persist(
                    run,
                    CellContent::ViolationPressure {
                        subject,
                        vp: reading.vp,
                        raw_total: reading.raw_total,
                        classification: reading.classification,
                        breakdown: reading.breakdown.clone(),
                    },
                )?;
                // Only a persisted reading may move quarantine, so the live
                // state always matches a replay of the tape.
                self.monitor.record(subject, &reading, Some(&instruction.id));
                self.quarantine
                    .observe(subject, reading.vp, Some(&instruction.id));
                Ok((InstructionResult::ViolationPressure { subject, reading }, Some(position)))
            }

            Operation::Compute(ComputeRequest::TraitConvergence { trait_name, a, b }) => {
                let (a, b, excluded) = self.gate_sources(*a, *b)?;
                run.identity = a.identity.or(b.identity);
                run.stage(Stage::Validated);
                run.stage(Stage::Dispatched);

                let converged = self
                    .convergence
                    .converge_detailed(trait_name, a.value, a.weight, b.value, b.weight)?;
                run.stage(Stage::Executed);

                let position = self.persist(
                    run,
                    CellContent::Convergence {
                        trait_name: trait_name.clone(),
                        value: converged.value,
                        clamped: converged.clamped,
                        excluded_sources: excluded.clone(),
                    },
                )?;
                Ok((
                    InstructionResult::Convergence {
                        trait_name: trait_name.clone(),
                        value: converged.value,
                        clamped: converged.clamped,
                        excluded_sources: excluded,
                    },
                    Some(position),
                ))
            }

            Operation::Compute(ComputeRequest::IdentityAnchor { traits }) => {
                let payload = Payload::new(traits.clone())?;
                run.stage(Stage::Validated);
                run.stage(Stage::Dispatched);
                let identity = anchor(&payload);
                run.identity = Some(identity);
                run.stage(Stage::Executed);
                let position = self.persist(run, CellContent::Anchor { identity })?;
                Ok((InstructionResult::Anchor { identity }, Some(position)))
            }

            Operation::Arbitrate {
                trait_name,
                candidates,
            } => {
                run.stage(Stage::Validated);
                run.stage(Stage::Dispatched);
                let winner = arbitrate(trait_name, candidates)?;
                run.identity = Some(winner.identity);
                run.stage(Stage::Executed);
                Ok((
                    InstructionResult::Arbitration {
                        trait_name: trait_name.clone(),
                        winner,
                    },
                    None,
                ))
            }
        }
    }

    /// Zero the weight of quarantined sources. Fails when none remain.
    fn gate_sources(
        &self,
        mut a: ConvergenceSource,
        mut b: ConvergenceSource,
    ) -> vigil_core::Result<(ConvergenceSource, ConvergenceSource, Vec<Identity>)> {
        let mut excluded = Vec::new();
        for source in [&mut a, &mut b] {
            if let Some(identity) = source.identity {
                if self.quarantine.is_quarantined(&identity) {
                    source.weight = 0.0;
                    excluded.push(identity);
                }
            }
        }
        if excluded.len() == 2 {
            return Err(Error::QuarantinedSource {
                identity: excluded[0],
            });
        }
        Ok((a, b, excluded))
    }

    fn persist(&self, run: &mut Run<'_>, content: CellContent) -> vigil_core::Result<u64> {
        let kind = content.kind();
        let position = self.ledger.write_cell(content, &run.writer)?;
        run.stage(Stage::Persisted);
        self.publish(Event::new(
            PUBLISHER,
            EventPayload::CellWritten {
                position,
                writer: run.writer.to_string(),
                kind: kind.to_string(),
            },
        ));
        Ok(position)
    }

    fn fail(
        &self,
        instruction_id: String,
        operation: String,
        identity: Option<Identity>,
        trait_name: Option<String>,
        source: Error,
    ) -> InstructionError {
        let trait_name = source.trait_name().map(str::to_string).or(trait_name);
        error!("Instruction {} ({}) failed: {}", instruction_id, operation, source);
        self.publish(Event::new(
            PUBLISHER,
            EventPayload::InstructionFailed {
                instruction_id: instruction_id.clone(),
                operation: operation.clone(),
                identity,
                error_kind: source.kind().to_string(),
                message: source.to_string(),
                trait_name,
            },
        ));
        InstructionError {
            instruction_id,
            operation,
            identity,
            source,
        }
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}
