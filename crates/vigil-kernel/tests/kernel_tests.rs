//! Tests for vigil-kernel: monitor, convergence, quarantine, engine, status, replay

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vigil_bus::{EventKind, EventPayload, QuarantineAction};
use vigil_core::*;
use vigil_kernel::*;

fn traits(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn config_with(envelopes: &[(&str, f64, f64, f64)]) -> KernelConfig {
    let mut config = KernelConfig::default();
    for (name, center, radius, compression) in envelopes {
        config.envelopes.insert(
            name.to_string(),
            EnvelopeSpec {
                center: *center,
                radius: *radius,
                compression: *compression,
            },
        );
    }
    config
}

fn kernel() -> KernelContext {
    KernelContext::new(config_with(&[("modularity", 0.3, 0.2, 1.0), ("x", 0.0, 1.0, 1.0)])).unwrap()
}

fn monitor_for(envelopes: &[(&str, f64, f64, f64)]) -> ViolationPressureMonitor {
    let registry = EnvelopeRegistry::from_envelopes(
        envelopes
            .iter()
            .map(|(n, c, r, k)| StabilityEnvelope::new(*n, *c, *r, *k).unwrap()),
    )
    .unwrap();
    ViolationPressureMonitor::new(Arc::new(registry), None)
}

// ===========================================================================
// Violation pressure
// ===========================================================================

#[test]
fn modularity_near_center_is_vp0() {
    let monitor = monitor_for(&[("modularity", 0.3, 0.2, 1.0)]);
    let payload = Payload::new(traits(&[("modularity", 0.28)])).unwrap();
    let reading = monitor.compute_violation_pressure(&payload);
    assert!((reading.vp - 0.1).abs() < 1e-9);
    assert!((reading.breakdown["modularity"] - 0.1).abs() < 1e-9);
    assert_eq!(reading.classification, VpClass::Vp0);
    assert_eq!(monitor.calculations(), 1);
}

#[test]
fn boundary_readings_round_up() {
    let monitor = monitor_for(&[("x", 0.0, 1.0, 1.0)]);
    let at = |v: f64| {
        monitor
            .measure(&Payload::new(traits(&[("x", v)])).unwrap())
            .classification
    };
    assert_eq!(at(0.25), VpClass::Vp1);
    assert_eq!(at(0.75), VpClass::Vp3);
    assert_eq!(at(-0.5), VpClass::Vp2);
    assert_eq!(at(1.0), VpClass::Vp4);
}

#[test]
fn vp_is_monotone_in_deviation_and_bounded() {
    let monitor = monitor_for(&[("a", 0.0, 0.5, 1.0), ("b", 1.0, 2.0, 3.0)]);
    let mut previous = 0.0;
    for step in 0..200 {
        let deviation = step as f64 * 0.05;
        let payload = Payload::new(traits(&[("a", deviation), ("b", 1.2)])).unwrap();
        let reading = monitor.measure(&payload);
        assert!(reading.vp >= previous, "VP decreased at step {step}");
        assert!((0.0..=1.0).contains(&reading.vp));
        previous = reading.vp;
    }
    assert_eq!(previous, 1.0);
}

#[test]
fn monitor_counts_only_published_readings() {
    let monitor = monitor_for(&[("x", 0.0, 1.0, 1.0)]);
    let payload = Payload::new(traits(&[("x", 0.3)])).unwrap();
    monitor.measure(&payload);
    assert_eq!(monitor.calculations(), 0);
    assert!(monitor.last_reading().is_none());
    monitor.compute_violation_pressure(&payload);
    assert_eq!(monitor.last_reading().unwrap().classification, VpClass::Vp1);
}

#[test]
fn value_at_center_of_tiny_band_is_vp0() {
    let monitor = monitor_for(&[("x", 0.5, 1e-200, 1e-200)]);
    let reading = monitor.measure(&Payload::new(traits(&[("x", 0.5)])).unwrap());
    assert_eq!(reading.vp, 0.0);
    assert_eq!(reading.breakdown["x"], 0.0);
    assert_eq!(reading.classification, VpClass::Vp0);
}

// ===========================================================================
// Convergence
// ===========================================================================

#[test]
fn unconstrained_midpoint_is_exact() {
    let engine = TraitConvergenceEngine::new(Arc::new(EnvelopeRegistry::new()));
    assert_eq!(engine.converge("x", 0.2, 1.0, 0.8, 1.0).unwrap(), 0.5);
}

#[test]
fn converged_values_stay_inside_envelope() {
    let registry = EnvelopeRegistry::from_envelopes([StabilityEnvelope::new("m", 0.3, 0.2, 1.0).unwrap()]).unwrap();
    let engine = TraitConvergenceEngine::new(Arc::new(registry));
    for i in 0..50 {
        let a = -5.0 + i as f64 * 0.3;
        for j in 0..10 {
            let w = 0.1 + j as f64;
            let v = engine.converge("m", a, w, 10.0 - a, 1.0).unwrap();
            assert!((0.3 - 0.2..=0.3 + 0.2).contains(&v), "{v} escaped the envelope");
        }
    }
}

#[test]
fn zero_weights_are_divergent() {
    let engine = TraitConvergenceEngine::new(Arc::new(EnvelopeRegistry::new()));
    let err = engine.converge("x", 0.2, 0.0, 0.8, 0.0).unwrap_err();
    assert!(matches!(err, Error::DivergentWeights { .. }));
    assert_eq!(err.trait_name(), Some("x"));
    assert!(engine.converge("x", f64::NAN, 1.0, 0.8, 1.0).is_err());
}

#[test]
fn status_follows_classification() {
    let monitor = monitor_for(&[("x", 0.0, 1.0, 1.0)]);
    let read = |v: f64| monitor.measure(&Payload::new(traits(&[("x", v)])).unwrap());
    assert_eq!(convergence_status(&read(0.1)), ConvergenceStatus::Stable);
    assert_eq!(convergence_status(&read(0.6)), ConvergenceStatus::Converging);
    assert_eq!(convergence_status(&read(0.9)), ConvergenceStatus::Diverging);
}

// ===========================================================================
// Engine: writes and reads
// ===========================================================================

#[test]
fn two_writes_land_at_zero_and_one() {
    let k = kernel();
    let first = k
        .engine
        .execute_instruction(AgentInstruction::write(traits(&[("modularity", 0.1)])))
        .unwrap();
    let second = k
        .engine
        .execute_instruction(AgentInstruction::write(traits(&[("modularity", 0.2)])))
        .unwrap();
    assert_eq!(first.position, Some(0));
    assert_eq!(second.position, Some(1));

    let read = k.engine.execute_instruction(AgentInstruction::read(1)).unwrap();
    match read.result {
        InstructionResult::Cell(cell) => match cell.content {
            CellContent::Payload { traits: payload, .. } => {
                assert_eq!(payload.get("modularity"), Some(0.2));
            }
            other => panic!("unexpected content {other:?}"),
        },
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(
        read.lifecycle,
        vec![
            Stage::Received,
            Stage::Validated,
            Stage::Dispatched,
            Stage::Executed,
            Stage::Returned
        ]
    );
}

#[test]
fn write_lifecycle_includes_persistence() {
    let k = kernel();
    let outcome = k
        .engine
        .execute_instruction(AgentInstruction::write(traits(&[("x", 0.1)])))
        .unwrap();
    assert!(outcome.lifecycle.contains(&Stage::Persisted));
    assert_eq!(outcome.lifecycle.last(), Some(&Stage::Returned));
}

#[test]
fn reading_unwritten_position_fails() {
    let k = kernel();
    let err = k.engine.execute_instruction(AgentInstruction::read(3)).unwrap_err();
    assert_eq!(err.kind(), "position_not_found");
    assert_eq!(err.operation, "READ");
}

#[test]
fn writer_id_is_recorded() {
    let k = kernel();
    k.engine
        .execute_instruction(AgentInstruction::write(traits(&[("x", 0.1)])).with_writer("router"))
        .unwrap();
    k.engine
        .execute_instruction(AgentInstruction::write(traits(&[("x", 0.2)])))
        .unwrap();
    assert_eq!(k.ledger.read_cell(0).unwrap().written_by.as_str(), "router");
    assert_eq!(k.ledger.read_cell(1).unwrap().written_by.as_str(), "vigil-kernel");
}

// ===========================================================================
// Engine: compute
// ===========================================================================

#[test]
fn anchor_of_empty_traits_fails_without_writing() {
    let k = kernel();
    let err = k
        .engine
        .execute_instruction(AgentInstruction::compute(ComputeRequest::IdentityAnchor {
            traits: BTreeMap::new(),
        }))
        .unwrap_err();
    assert!(matches!(err.source, Error::InvalidPayload { .. }));
    assert_eq!(k.ledger.get_summary().total_cells, 0);
}

#[test]
fn anchor_compute_persists_identity() {
    let k = kernel();
    let outcome = k
        .engine
        .execute_instruction(AgentInstruction::compute(ComputeRequest::IdentityAnchor {
            traits: traits(&[("modularity", 0.28)]),
        }))
        .unwrap();
    let InstructionResult::Anchor { identity } = outcome.result else {
        panic!("expected anchor result");
    };
    assert_eq!(identity.to_string(), "b0e4d6f9-c2ae-89a5-8621-80d48c6d45da");
    assert_eq!(
        k.ledger.read_cell(0).unwrap().content,
        CellContent::Anchor { identity }
    );
}

#[test]
fn vp_compute_persists_reading() {
    let k = kernel();
    let outcome = k
        .engine
        .execute_instruction(AgentInstruction::compute(ComputeRequest::ViolationPressure {
            traits: traits(&[("modularity", 0.28)]),
            subject: None,
        }))
        .unwrap();
    assert_eq!(outcome.position, Some(0));
    match k.ledger.read_cell(0).unwrap().content {
        CellContent::ViolationPressure { vp, classification, .. } => {
            assert!((vp - 0.1).abs() < 1e-9);
            assert_eq!(classification, VpClass::Vp0);
        }
        other => panic!("unexpected content {other:?}"),
    }
}

#[test]
fn convergence_without_envelope_is_the_weighted_mean() {
    let k = kernel();
    let outcome = k
        .engine
        .execute_instruction(AgentInstruction::compute(ComputeRequest::TraitConvergence {
            trait_name: "unmonitored".into(),
            a: ConvergenceSource::new(0.2, 1.0),
            b: ConvergenceSource::new(0.8, 1.0),
        }))
        .unwrap();
    match outcome.result {
        InstructionResult::Convergence { value, clamped, .. } => {
            assert_eq!(value, 0.5);
            assert!(!clamped);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn failed_convergence_writes_nothing() {
    let k = kernel();
    let err = k
        .engine
        .execute_instruction(AgentInstruction::compute(ComputeRequest::TraitConvergence {
            trait_name: "x".into(),
            a: ConvergenceSource::new(0.2, 0.0),
            b: ConvergenceSource::new(0.8, 0.0),
        }))
        .unwrap_err();
    assert_eq!(err.kind(), "divergent_weights");
    assert_eq!(k.ledger.next_position(), 0);
}

// ===========================================================================
// Engine: quarantine gating
// ===========================================================================

fn vp_for(k: &KernelContext, subject: Identity, x: f64) {
    k.engine
        .execute_instruction(AgentInstruction::compute(ComputeRequest::ViolationPressure {
            traits: traits(&[("x", x)]),
            subject: Some(subject),
        }))
        .unwrap();
}

#[test]
fn quarantine_hysteresis_through_engine() {
    let k = kernel();
    let who = anchor_traits(&traits(&[("organism", 7.0)])).unwrap();

    vp_for(&k, who, 0.80);
    assert!(k.quarantine.is_quarantined(&who));
    vp_for(&k, who, 0.60);
    assert!(k.quarantine.is_quarantined(&who), "released too early");
    vp_for(&k, who, 0.40);
    assert!(!k.quarantine.is_quarantined(&who));
}

#[test]
fn quarantined_source_is_excluded_from_convergence() {
    let k = kernel();
    let bad = anchor_traits(&traits(&[("organism", 1.0)])).unwrap();
    let good = anchor_traits(&traits(&[("organism", 2.0)])).unwrap();
    vp_for(&k, bad, 0.9);

    let outcome = k
        .engine
        .execute_instruction(AgentInstruction::compute(ComputeRequest::TraitConvergence {
            trait_name: "unmonitored".into(),
            a: ConvergenceSource::from_identity(bad, 100.0, 1.0),
            b: ConvergenceSource::from_identity(good, 0.4, 1.0),
        }))
        .unwrap();
    match outcome.result {
        InstructionResult::Convergence {
            value,
            excluded_sources,
            ..
        } => {
            assert_eq!(value, 0.4);
            assert_eq!(excluded_sources, vec![bad]);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn all_sources_quarantined_fails() {
    let k = kernel();
    let a = anchor_traits(&traits(&[("organism", 1.0)])).unwrap();
    let b = anchor_traits(&traits(&[("organism", 2.0)])).unwrap();
    vp_for(&k, a, 0.9);
    vp_for(&k, b, 0.95);
    let before = k.ledger.next_position();

    let err = k
        .engine
        .execute_instruction(AgentInstruction::compute(ComputeRequest::TraitConvergence {
            trait_name: "x".into(),
            a: ConvergenceSource::from_identity(a, 0.1, 1.0),
            b: ConvergenceSource::from_identity(b, 0.2, 1.0),
        }))
        .unwrap_err();
    assert_eq!(err.kind(), "quarantined_source");
    assert_eq!(k.ledger.next_position(), before);
}

#[test]
fn failed_vp_write_leaves_no_trace() {
    let mut config = config_with(&[("x", 0.0, 1.0, 1.0)]);
    config.ledger.max_cells = Some(0);
    let k = KernelContext::new(config).unwrap();
    let who = anchor_traits(&traits(&[("organism", 4.0)])).unwrap();

    let err = k
        .engine
        .execute_instruction(AgentInstruction::compute(ComputeRequest::ViolationPressure {
            traits: traits(&[("x", 0.9)]),
            subject: Some(who),
        }))
        .unwrap_err();
    assert_eq!(err.kind(), "storage_exhausted");

    assert!(!k.quarantine.is_quarantined(&who));
    assert_eq!(k.monitor.calculations(), 0);
    assert!(k.monitor.last_reading().is_none());
    assert!(k.bus.replay(&EventKind::ViolationPressure.into()).is_empty());

    let state = rebuild(&k.ledger).unwrap();
    assert_eq!(state.quarantine.is_quarantined(&who), k.quarantine.is_quarantined(&who));
}

// ===========================================================================
// Engine: arbitration and wire form
// ===========================================================================

#[test]
fn arbitration_is_not_persisted() {
    let k = kernel();
    let a = anchor_traits(&traits(&[("organism", 1.0)])).unwrap();
    let b = anchor_traits(&traits(&[("organism", 2.0)])).unwrap();
    let outcome = k
        .engine
        .execute_json(&json!({
            "operation": "ARBITRATE",
            "parameters": {
                "trait_name": "modularity",
                "candidates": [
                    {"identity": a.to_string(), "value": 0.2, "weight": 1.0},
                    {"identity": b.to_string(), "value": 0.4, "weight": 5.0}
                ]
            }
        }))
        .unwrap();
    assert_eq!(outcome.position, None);
    match outcome.result {
        InstructionResult::Arbitration { winner, .. } => assert_eq!(winner.identity, b),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(k.ledger.next_position(), 0);
}

#[test]
fn unknown_operation_fails_and_engine_continues() {
    let k = kernel();
    let err = k
        .engine
        .execute_json(&json!({"id": "bad-1", "operation": "TELEPORT"}))
        .unwrap_err();
    assert_eq!(err.kind(), "unsupported_instruction");
    assert_eq!(err.instruction_id, "bad-1");

    let ok = k.engine.execute_json(&json!({
        "operation": "WRITE",
        "parameters": {"traits": {"x": 0.5}}
    }));
    assert_eq!(ok.unwrap().position, Some(0));
}

// ===========================================================================
// Events
// ===========================================================================

#[tokio::test]
async fn failures_and_writes_are_published() {
    let k = kernel();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    k.bus.subscribe_fn(
        "audit",
        vec![EventKind::InstructionFailed, EventKind::CellWritten],
        move |event| sink.lock().unwrap().push(event.clone()),
    );

    let _ = k.engine.execute_json(&json!({"id": "x-1", "operation": "FLY"}));
    k.engine
        .execute_instruction(AgentInstruction::write(traits(&[("x", 0.1)])))
        .unwrap();
    assert!(k.bus.wait_idle(Duration::from_secs(5)).await);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    match &seen[0].payload {
        EventPayload::InstructionFailed {
            instruction_id,
            error_kind,
            ..
        } => {
            assert_eq!(instruction_id, "x-1");
            assert_eq!(error_kind, "unsupported_instruction");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(seen[1].payload, EventPayload::CellWritten { position: 0, .. }));
}

#[tokio::test]
async fn quarantine_reacts_to_collaborator_readings() {
    let k = kernel();
    let who = anchor_traits(&traits(&[("organism", 3.0)])).unwrap();

    // A reading from another publisher reaches quarantine only via the bus.
    k.bus.publish(vigil_bus::Event::new(
        "collaborator",
        EventPayload::ViolationPressure {
            subject: who,
            vp: 0.9,
            raw_total: 0.9,
            classification: classify(0.9),
            breakdown: traits(&[("x", 0.9)]),
            operation_ref: Some("external".into()),
        },
    ));
    assert!(k.bus.wait_idle(Duration::from_secs(5)).await);
    assert!(k.quarantine.is_quarantined(&who));

    let entered = k
        .bus
        .replay(&EventKind::Quarantine.into())
        .into_iter()
        .any(|e| matches!(e.payload, EventPayload::Quarantine { action: QuarantineAction::Quarantined, .. }));
    assert!(entered);
}

#[tokio::test]
async fn engine_readings_move_quarantine_once() {
    let k = kernel();
    let who = anchor_traits(&traits(&[("organism", 5.0)])).unwrap();

    vp_for(&k, who, 0.8);
    vp_for(&k, who, 0.4);
    assert!(k.bus.wait_idle(Duration::from_secs(5)).await);

    assert!(!k.quarantine.is_quarantined(&who));
    assert_eq!(k.quarantine.released_count(), 1);
    let actions: Vec<QuarantineAction> = k
        .bus
        .replay(&EventKind::Quarantine.into())
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::Quarantine { action, .. } => Some(action),
            _ => None,
        })
        .collect();
    assert_eq!(actions, vec![QuarantineAction::Quarantined, QuarantineAction::Released]);
}

#[tokio::test]
async fn consolidation_reports_both_thresholds() {
    let k = kernel();
    let calm = k
        .monitor
        .compute_violation_pressure(&Payload::new(traits(&[("modularity", 0.3)])).unwrap());

    assert!(k.consolidation.evaluate(0.5, &calm).is_none());
    // The domain threshold itself is not below the threshold.
    assert!(k.consolidation.evaluate(0.3, &calm).is_none());
    let found = k.consolidation.evaluate(0.2, &calm).unwrap();
    assert_eq!(found.domain_threshold, 0.3);
    assert_eq!(found.vp_boundary, VP1_BOUNDARY);
    assert_eq!(k.bus.replay(&EventKind::Consolidation.into()).len(), 1);

    let stressed = k
        .monitor
        .compute_violation_pressure(&Payload::new(traits(&[("modularity", 0.45)])).unwrap());
    assert!(k.consolidation.evaluate(0.2, &stressed).is_none());
}

// ===========================================================================
// Status and replay
// ===========================================================================

#[test]
fn status_reports_latest_vp_and_phase() {
    let k = kernel();
    let empty = k.status().unwrap();
    assert_eq!(empty.phase, Phase::Precision);
    assert_eq!(empty.tape.total_cells, 0);

    let who = anchor_traits(&traits(&[("organism", 1.0)])).unwrap();
    vp_for(&k, who, 0.8);
    k.engine
        .execute_instruction(AgentInstruction::write(traits(&[("x", 0.0)])))
        .unwrap();

    let status = k.status().unwrap();
    assert_eq!(status.vp_classification, VpClass::Vp3);
    assert_eq!(status.phase, Phase::Chaos);
    assert_eq!(status.vp_calculations, 1);
    assert_eq!(status.active_quarantines, 1);
    assert_eq!(status.tape.next_position, 2);
    assert_eq!(status.trait_count, 2);
}

#[test]
fn durable_kernel_restores_envelopes_and_quarantine() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_with(&[("x", 0.0, 1.0, 1.0)]);
    config.ledger.dir = Some(dir.path().to_path_buf());
    config.ledger.fsync = false;
    let who = anchor_traits(&traits(&[("organism", 9.0)])).unwrap();

    {
        let k = KernelContext::new(config.clone()).unwrap();
        k.update_envelope(StabilityEnvelope::new("x", 0.0, 2.0, 1.0).unwrap())
            .unwrap();
        vp_for(&k, who, 1.8);
        assert!(k.quarantine.is_quarantined(&who));
    }

    let k = KernelContext::new(config).unwrap();
    assert_eq!(k.registry.get("x").unwrap().radius, 2.0);
    assert!(k.quarantine.is_quarantined(&who));

    let state = rebuild(&k.ledger).unwrap();
    assert_eq!(state.cells_replayed, 2);
    assert_eq!(state.envelope_updates, 1);
    assert!(state.quarantine.is_quarantined(&who));
}
