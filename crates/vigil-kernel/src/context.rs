//! The kernel context: every component, built once and wired together.
//!
//! Components never reach for globals; each receives what it needs from
//! here, so tests can build as many isolated kernels as they like.

use crate::consolidation::ConsolidationDetector;
use crate::convergence::TraitConvergenceEngine;
use crate::engine::InstructionEngine;
use crate::monitor::ViolationPressureMonitor;
use crate::quarantine::TemporalIsolationManager;
use crate::replay;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use vigil_bus::{BusConfig, BusStats, EventBus, SubscriptionHandle};
use vigil_core::{
    classify, CellContent, EnvelopeRegistry, KernelConfig, Result, StabilityEnvelope, VpClass,
    WriterId,
};
use vigil_ledger::{LedgerSummary, TapeLedger};

/// Cells scanned backwards from the tape head when reporting the latest VP.
const STATUS_SCAN: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// VP0: the system is inside its envelopes.
    Precision,
    /// Any higher class.
    Chaos,
}

impl Phase {
    pub fn from_class(class: VpClass) -> Self {
        match class {
            VpClass::Vp0 => Self::Precision,
            _ => Self::Chaos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelStatus {
    pub violation_pressure: f64,
    pub vp_classification: VpClass,
    pub phase: Phase,
    pub vp_calculations: u64,
    pub trait_count: usize,
    pub tape: LedgerSummary,
    pub active_quarantines: usize,
    pub released_quarantines: u64,
    pub bus: BusStats,
}

pub struct KernelContext {
    pub config: KernelConfig,
    pub registry: Arc<EnvelopeRegistry>,
    pub ledger: Arc<TapeLedger>,
    pub bus: EventBus,
    pub quarantine: Arc<TemporalIsolationManager>,
    pub monitor: Arc<ViolationPressureMonitor>,
    pub convergence: Arc<TraitConvergenceEngine>,
    pub engine: InstructionEngine,
    pub consolidation: ConsolidationDetector,
    writer: WriterId,
    subscription: Option<SubscriptionHandle>,
}

impl KernelContext {
    /// Build every component from `config`, replaying the tape if it has
    /// history. The quarantine manager is subscribed to the bus when a
    /// tokio runtime is available.
    pub fn new(config: KernelConfig) -> Result<Self> {
        let ledger = Arc::new(TapeLedger::from_section(&config.ledger)?);
        Self::with_ledger(config, ledger)
    }

    /// Like `new`, with a ledger the caller already opened.
    pub fn with_ledger(config: KernelConfig, ledger: Arc<TapeLedger>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(EnvelopeRegistry::from_envelopes(config.stability_envelopes())?);
        let bus = EventBus::new(BusConfig::from(&config.bus));
        let quarantine = Arc::new(TemporalIsolationManager::new(Some(bus.clone())));

        if ledger.next_position() > 0 {
            let (cells, updates, readings) = replay::apply(&ledger, &registry, &quarantine, 0)?;
            info!(
                "Restored state from {} cells ({} envelope updates, {} VP readings)",
                cells, updates, readings
            );
        }

        let monitor = Arc::new(ViolationPressureMonitor::new(registry.clone(), Some(bus.clone())));
        let convergence = Arc::new(TraitConvergenceEngine::new(registry.clone()));
        let writer = WriterId::new(config.engine.writer.clone());
        let engine = InstructionEngine::new(
            ledger.clone(),
            monitor.clone(),
            convergence.clone(),
            quarantine.clone(),
            Some(bus.clone()),
            writer.clone(),
        );
        let consolidation = ConsolidationDetector::new(&config.consolidation, Some(bus.clone()));

        let subscription = match tokio::runtime::Handle::try_current() {
            Ok(_) => Some(quarantine.attach(&bus)),
            Err(_) => {
                warn!("No tokio runtime; quarantine observes engine readings only");
                None
            }
        };

        info!(
            "Kernel ready: {} envelopes, tape at position {}",
            registry.len(),
            ledger.next_position()
        );
        Ok(Self {
            config,
            registry,
            ledger,
            bus,
            quarantine,
            monitor,
            convergence,
            engine,
            consolidation,
            writer,
            subscription,
        })
    }

    /// Replace an envelope and record the change on the tape.
    pub fn update_envelope(&self, envelope: StabilityEnvelope) -> Result<u64> {
        envelope.validate()?;
        let name = envelope.trait_name.clone();
        let position = self
            .ledger
            .write_cell(CellContent::EnvelopeUpdate { envelope: envelope.clone() }, &self.writer)?;
        self.registry.set(&name, envelope)?;
        info!("Envelope for '{}' updated at tape position {}", name, position);
        Ok(position)
    }

    /// Point-in-time report. The latest VP comes from the most recent VP
    /// cell near the tape head, falling back to the monitor's last reading.
    pub fn status(&self) -> Result<KernelStatus> {
        let tape = self.ledger.get_summary();
        let mut latest = None;
        for cell in self.ledger.tail(STATUS_SCAN)?.into_iter().rev() {
            if let CellContent::ViolationPressure {
                vp, classification, ..
            } = cell.content
            {
                latest = Some((vp, classification));
                break;
            }
        }
        let (vp, class) = latest
            .or_else(|| self.monitor.last_reading().map(|r| (r.vp, r.classification)))
            .unwrap_or((0.0, classify(0.0)));

        Ok(KernelStatus {
            violation_pressure: vp,
            vp_classification: class,
            phase: Phase::from_class(class),
            vp_calculations: self.monitor.calculations(),
            trait_count: self.registry.len(),
            tape,
            active_quarantines: self.quarantine.active_count(),
            released_quarantines: self.quarantine.released_count(),
            bus: self.bus.stats(),
        })
    }

    pub fn shutdown(&self) {
        if let Some(handle) = &self.subscription {
            self.bus.unsubscribe(handle);
        }
        self.bus.shutdown();
    }
}
