//! Token launches with bundled bot buys.

pub mod coordinator;
pub mod request;

pub use coordinator::{LaunchCoordinator, LaunchOutcome};
pub use request::LaunchRequest;
