//! Cover state engine: reconciliation, polling and orchestration.

pub mod controller;
pub mod restore;
pub mod scheduler;
pub mod state;

pub use controller::{CoverCommand, CoverController, CoverEvent};
pub use scheduler::PollScheduler;
pub use state::{CoverState, reconcile};
