//! vigil core - types, identity anchoring, stability envelopes, and errors

pub mod cell;
pub mod classification;
pub mod config;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod types;

pub use cell::CellContent;
pub use classification::{
    classify, VpClass, VP1_BOUNDARY, VP2_BOUNDARY, VP3_BOUNDARY, VP4_BOUNDARY,
};
pub use config::{
    BusSection, ConsolidationSection, EngineSection, EnvelopeSpec, KernelConfig, LedgerSection,
};
pub use envelope::{EnvelopeRegistry, EnvelopeSnapshot, StabilityEnvelope};
pub use error::{Error, Result};
pub use identity::{anchor, anchor_traits, Identity, NAMESPACE};
pub use types::{Payload, WriterId};
