pub mod cdevents;
pub mod clock;
pub mod orchestrator;
pub mod probe;
pub mod prometheus;
pub mod reconciler;
pub mod validation;
pub mod weight;

pub use orchestrator::{Context, Orchestrator, OrchestratorError};
pub use validation::{validate_plan, PlanValidationError};

