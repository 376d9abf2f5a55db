//! vigil kernel - governance over collaborator state
//!
//! Measures how far payloads drift from their stability envelopes, blends
//! trait values without leaving those envelopes, quarantines identities
//! under sustained pressure, and records every result on the tape.

pub mod arbitration;
pub mod consolidation;
pub mod context;
pub mod convergence;
pub mod engine;
pub mod instruction;
pub mod monitor;
pub mod quarantine;
pub mod replay;

pub use arbitration::{arbitrate, Candidate};
pub use consolidation::{Consolidation, ConsolidationDetector};
pub use context::{KernelContext, KernelStatus, Phase};
pub use convergence::{status as convergence_status, ConvergenceStatus, Converged, TraitConvergenceEngine};
pub use engine::{InstructionEngine, InstructionError, InstructionOutcome, InstructionResult, Stage};
pub use instruction::{AgentInstruction, ComputeRequest, ConvergenceSource, Operation};
pub use monitor::{ViolationPressureMonitor, VpReading};
pub use quarantine::{QuarantineRecord, QuarantineTransition, TemporalIsolationManager};
pub use replay::{rebuild, ReplayState};
