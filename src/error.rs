//! User-visible error taxonomy.
//!
//! Components work in `anyhow::Result` internally; anything that reaches a
//! caller, the control channel or a persisted `failure_reason` goes through
//! [`PipelineError`] so it carries a stable reason code.

use crate::types::Lamports;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or policy-violating input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient balance: required {required} lamports, available {available}")]
    InsufficientBalance {
        required: Lamports,
        available: Lamports,
    },

    #[error("enrichment did not become ready for {mint} after {attempts} attempts")]
    EnrichmentTimeout { mint: String, attempts: u32 },

    #[error("block builder rejected bundle: {0}")]
    BundleRejected(String),

    #[error("bundle {bundle_id} not observed within {window_secs}s")]
    BundleNotLanded { bundle_id: String, window_secs: u64 },

    #[error("partial fill: {landed} of {expected} buys landed")]
    PartialFill { landed: usize, expected: usize },

    #[error("exit for position {position_id} failed after {attempts} attempts")]
    ExitFailedManual { position_id: i64, attempts: usize },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Short, stable reason code persisted on entities and pushed to clients.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::InsufficientBalance { .. } => "insufficient_balance",
            PipelineError::EnrichmentTimeout { .. } => "enrichment_timeout",
            PipelineError::BundleRejected(_) => "bundle_rejected",
            PipelineError::BundleNotLanded { .. } => "bundle_not_landed",
            PipelineError::PartialFill { .. } => "partial_fill",
            PipelineError::ExitFailedManual { .. } => "exit_failed_manual",
            PipelineError::Auth(_) => "auth",
            PipelineError::Internal(_) => "internal",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        PipelineError::Auth(msg.into())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
