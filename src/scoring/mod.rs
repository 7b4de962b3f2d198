//! Deterministic scoring of enriched tokens.
//!
//! Weights, thresholds and the label table come from a named, versioned
//! [`ScoringProfile`]; the [`ScoringEngine`] itself does no I/O.

pub mod engine;
pub mod profile;

pub use engine::ScoringEngine;
pub use profile::{AxisWeights, LabelTable, ScoringProfile, ScoringThresholds};
