mod orchestrator;
mod runtime;
mod shutdown;
mod startup;
mod state;
mod types;


pub use orchestrator::Orchestrator;
pub use types::ShutdownReason;
