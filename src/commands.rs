//! Operator commands behind the `vigil` binary.
//!
//! Each command returns JSON so the binary only has to print it; tests call
//! these directly.

use anyhow::Context;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use vigil_core::KernelConfig;
use vigil_kernel::{rebuild, KernelContext};
use vigil_ledger::TapeLedger;

/// Log filter used when `RUST_LOG` is unset: every workspace crate at info.
pub const DEFAULT_LOG_FILTER: &str =
    "vigil=info,vigil_core=info,vigil_ledger=info,vigil_bus=info,vigil_kernel=info";

/// Config from `config_path` (defaults when absent), with `ledger_dir`
/// overriding the configured tape directory.
pub fn resolve_config(config_path: Option<&Path>, ledger_dir: Option<PathBuf>) -> anyhow::Result<KernelConfig> {
    let mut config = match config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            KernelConfig::from_toml_str(&text).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => KernelConfig::default(),
    };
    if ledger_dir.is_some() {
        config.ledger.dir = ledger_dir;
    }
    Ok(config)
}

/// The configured tape directory; `command` names the caller in the error.
pub fn require_tape<'a>(config: &'a KernelConfig, command: &str) -> anyhow::Result<&'a Path> {
    match &config.ledger.dir {
        Some(dir) => Ok(dir),
        None => anyhow::bail!("{command} needs a tape: pass --ledger or set [ledger].dir"),
    }
}

pub fn open_kernel(config: KernelConfig) -> anyhow::Result<KernelContext> {
    KernelContext::new(config).context("starting kernel")
}

pub fn summary(kernel: &KernelContext) -> anyhow::Result<Value> {
    Ok(serde_json::to_value(kernel.status()?)?)
}

pub fn read(kernel: &KernelContext, position: u64) -> anyhow::Result<Value> {
    let cell = kernel.ledger.read_cell(position)?;
    Ok(serde_json::to_value(cell)?)
}

pub fn tail(kernel: &KernelContext, n: u64) -> anyhow::Result<Value> {
    let cells = kernel.ledger.tail(n)?;
    Ok(serde_json::to_value(cells)?)
}

/// Walk the whole tape and report what it rebuilds to.
pub fn replay(ledger: &TapeLedger) -> anyhow::Result<Value> {
    let state = rebuild(ledger)?;
    let quarantined: Vec<String> = state
        .quarantine
        .active()
        .iter()
        .map(|r| r.identity.to_string())
        .collect();
    let envelopes = state.registry.snapshot();
    Ok(json!({
        "cells_replayed": state.cells_replayed,
        "envelope_updates": state.envelope_updates,
        "vp_readings": state.vp_readings,
        "envelopes": &*envelopes,
        "quarantined": quarantined,
    }))
}

/// Execute one wire-form instruction.
pub fn exec(kernel: &KernelContext, instruction: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(instruction).context("instruction is not valid JSON")?;
    let outcome = kernel.engine.execute_json(&value)?;
    Ok(serde_json::to_value(outcome)?)
}

pub fn dump_config(config: &KernelConfig) -> String {
    config.to_toml()
}
