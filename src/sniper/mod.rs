//! Automatic buying of scored mints on behalf of sniper users.

pub mod executor;
pub mod filter;

pub use executor::{SnipeJob, SnipeOutcome, SniperSupervisor};
pub use filter::{evaluate, FilterDecision};
