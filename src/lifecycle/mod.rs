pub mod failure;
pub mod orchestrator;
pub mod state_machine;
pub mod status;

pub use failure::{FailureHandler, FailurePolicy, RestartOutcome, Restarter};
pub use orchestrator::Orchestrator;
pub use state_machine::{can_transition, IsolateState};
pub use status::{IsolateEntry, IsolateStatus};
