//! Kernel configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists. Classification
//! boundaries are deliberately absent: they are constants, not settings.

use crate::envelope::StabilityEnvelope;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level kernel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Tape ledger storage.
    pub ledger: LedgerSection,
    /// Event bus capacities.
    pub bus: BusSection,
    /// Instruction engine settings.
    pub engine: EngineSection,
    /// Domain consolidation threshold, owned by the collaborator.
    pub consolidation: ConsolidationSection,
    /// Stability envelopes keyed by trait name.
    pub envelopes: BTreeMap<String, EnvelopeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// Segment directory. `None` keeps the tape in memory only.
    pub dir: Option<PathBuf>,
    /// Cells per segment file.
    pub segment_cells: u64,
    /// Sealed segments kept resident in memory.
    pub cache_segments: usize,
    /// `sync_data` each append before returning.
    pub fsync: bool,
    /// Hard capacity in cells. `None` leaves a durable tape bounded only by
    /// u64 positions; an in-memory tape falls back to a fixed cap.
    pub max_cells: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Undelivered events buffered per subscriber before the oldest is dropped.
    pub subscriber_queue: usize,
    /// Events retained for replay and audit.
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Writer id recorded on cells when an instruction names none.
    pub writer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationSection {
    /// Name of the collaborator's domain metric (e.g. "modularity").
    pub domain_metric: String,
    /// Domain metric value strictly below which consolidation is reported.
    pub domain_threshold: f64,
}

/// Envelope as written in config, keyed by trait name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSpec {
    pub center: f64,
    pub radius: f64,
    #[serde(default = "default_compression")]
    pub compression: f64,
}

fn default_compression() -> f64 {
    1.0
}

// ============================================================
// Defaults
// ============================================================

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            dir: None,
            segment_cells: 4_096,
            cache_segments: 8,
            fsync: true,
            max_cells: None,
        }
    }
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            subscriber_queue: 1_024,
            history_capacity: 10_000,
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            writer: "vigil-kernel".into(),
        }
    }
}

impl Default for ConsolidationSection {
    fn default() -> Self {
        Self {
            domain_metric: "modularity".into(),
            domain_threshold: 0.3,
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl KernelConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to load {}: {}; using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.segment_cells == 0 {
            return Err(Error::Config("ledger.segment_cells must be >= 1".into()));
        }
        if self.bus.subscriber_queue == 0 {
            return Err(Error::Config("bus.subscriber_queue must be >= 1".into()));
        }
        if self.bus.history_capacity == 0 {
            return Err(Error::Config("bus.history_capacity must be >= 1".into()));
        }
        if !self.consolidation.domain_threshold.is_finite() {
            return Err(Error::Config(format!(
                "consolidation.domain_threshold must be finite, got {}",
                self.consolidation.domain_threshold
            )));
        }
        for envelope in self.stability_envelopes() {
            envelope.validate()?;
        }
        Ok(())
    }

    /// Envelopes as validated-shape values, in trait-name order.
    pub fn stability_envelopes(&self) -> Vec<StabilityEnvelope> {
        self.envelopes
            .iter()
            .map(|(name, spec)| StabilityEnvelope {
                trait_name: name.clone(),
                center: spec.center,
                radius: spec.radius,
                compression: spec.compression,
            })
            .collect()
    }
}
