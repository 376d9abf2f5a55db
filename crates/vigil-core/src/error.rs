//! Error types for vigil

use crate::identity::Identity;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid payload{}: {reason}", trait_suffix(.trait_name))]
    InvalidPayload {
        reason: String,
        trait_name: Option<String>,
    },

    #[error("invalid envelope for trait '{trait_name}': {reason}")]
    InvalidEnvelope { trait_name: String, reason: String },

    #[error("divergent weights for trait '{trait_name}': {weight_a} + {weight_b} is not a positive finite sum")]
    DivergentWeights {
        trait_name: String,
        weight_a: f64,
        weight_b: f64,
    },

    #[error("tape position {position} not found (next free position is {next_position})")]
    PositionNotFound { position: u64, next_position: u64 },

    #[error("unsupported instruction: {operation}")]
    UnsupportedInstruction { operation: String },

    #[error("tape storage exhausted: capacity of {capacity} cells reached")]
    StorageExhausted { capacity: u64 },

    #[error("identity {identity} is quarantined and cannot feed convergence")]
    QuarantinedSource { identity: Identity },

    #[error("corrupted tape: {0}")]
    Corrupt(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn trait_suffix(trait_name: &Option<String>) -> String {
    match trait_name {
        Some(name) => format!(" (trait '{}')", name),
        None => String::new(),
    }
}

impl Error {
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
            trait_name: None,
        }
    }

    pub fn invalid_trait(trait_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
            trait_name: Some(trait_name.into()),
        }
    }

    pub fn invalid_envelope(trait_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEnvelope {
            trait_name: trait_name.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::UnsupportedInstruction {
            operation: operation.into(),
        }
    }

    /// Short machine-readable name, used in failure events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::InvalidEnvelope { .. } => "invalid_envelope",
            Self::DivergentWeights { .. } => "divergent_weights",
            Self::PositionNotFound { .. } => "position_not_found",
            Self::UnsupportedInstruction { .. } => "unsupported_instruction",
            Self::StorageExhausted { .. } => "storage_exhausted",
            Self::QuarantinedSource { .. } => "quarantined_source",
            Self::Corrupt(_) => "corrupt",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Only storage I/O may be retried, and only by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// The offending trait, when the error is about one.
    pub fn trait_name(&self) -> Option<&str> {
        match self {
            Self::InvalidPayload { trait_name, .. } => trait_name.as_deref(),
            Self::InvalidEnvelope { trait_name, .. } | Self::DivergentWeights { trait_name, .. } => {
                Some(trait_name)
            }
            _ => None,
        }
    }
}
