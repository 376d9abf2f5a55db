//! Rebuilding in-memory state from the tape
//!
//! The envelope registry and the quarantine table are not persisted on
//! their own. Walking the tape in position order and re-applying envelope
//! updates and VP readings reproduces both.

use crate::quarantine::TemporalIsolationManager;
use tracing::info;
use vigil_core::{CellContent, EnvelopeRegistry, Result};
use vigil_ledger::TapeLedger;

/// Cells read per batch while walking the tape.
const BATCH: u64 = 1_024;

pub struct ReplayState {
    pub registry: EnvelopeRegistry,
    pub quarantine: TemporalIsolationManager,
    pub cells_replayed: u64,
    pub envelope_updates: u64,
    pub vp_readings: u64,
}

/// Replay the whole tape into fresh state. No events are published.
pub fn rebuild(ledger: &TapeLedger) -> Result<ReplayState> {
    let mut state = ReplayState {
        registry: EnvelopeRegistry::new(),
        quarantine: TemporalIsolationManager::new(None),
        cells_replayed: 0,
        envelope_updates: 0,
        vp_readings: 0,
    };
    apply(ledger, &state.registry, &state.quarantine, 0).map(|(cells, updates, readings)| {
        state.cells_replayed = cells;
        state.envelope_updates = updates;
        state.vp_readings = readings;
    })?;
    info!(
        "Replayed {} cells ({} envelope updates, {} VP readings, {} quarantined)",
        state.cells_replayed,
        state.envelope_updates,
        state.vp_readings,
        state.quarantine.active_count()
    );
    Ok(state)
}

/// Apply cells from `start` onward to existing state.
/// Returns `(cells, envelope updates, VP readings)` applied.
pub fn apply(
    ledger: &TapeLedger,
    registry: &EnvelopeRegistry,
    quarantine: &TemporalIsolationManager,
    start: u64,
) -> Result<(u64, u64, u64)> {
    let end = ledger.next_position();
    let (mut cells, mut updates, mut readings) = (0, 0, 0);
    let mut position = start;

    while position < end {
        let batch_end = position.saturating_add(BATCH).min(end);
        for cell in ledger.read_range(position..batch_end)? {
            match cell.content {
                CellContent::EnvelopeUpdate { envelope } => {
                    let name = envelope.trait_name.clone();
                    registry.set(&name, envelope)?;
                    updates += 1;
                }
                CellContent::ViolationPressure { subject, vp, .. } => {
                    quarantine.observe(subject, vp, None);
                    readings += 1;
                }
                _ => {}
            }
            cells += 1;
        }
        position = batch_end;
    }
    Ok((cells, updates, readings))
}
