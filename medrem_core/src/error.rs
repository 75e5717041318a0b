//! Error types for the medrem_core library.

use crate::{DeliveryResult, DoseStatus, ObligationId};
use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for medrem_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Prescription definition rejected at registration or rule edit
    #[error("Invalid dosing rule: {0}")]
    InvalidRule(String),

    /// Attempted move out of a terminal state or from an impossible source state
    #[error("Dose {obligation} cannot move from {from} to {to}")]
    InvalidTransition {
        obligation: ObligationId,
        from: DoseStatus,
        to: DoseStatus,
    },

    /// Unknown obligation or prescription id
    #[error("Unknown {kind}: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Transport-level delivery failure after retries
    #[error("Delivery to {recipient} failed: {result:?}")]
    DeliveryFailure {
        recipient: String,
        result: DeliveryResult,
    },

    /// Adherence window out of range
    #[error("Invalid adherence window: {0}")]
    InvalidWindow(String),

    /// A ledger lock was poisoned by a panicking holder
    #[error("Ledger lock poisoned")]
    LockPoisoned,
}

impl Error {
    pub(crate) fn unknown_dose(id: ObligationId) -> Self {
        Error::NotFound {
            kind: "dose",
            id: id.to_string(),
        }
    }

    pub(crate) fn unknown_prescription(id: impl ToString) -> Self {
        Error::NotFound {
            kind: "prescription",
            id: id.to_string(),
        }
    }
}
