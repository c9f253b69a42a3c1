//! Dependency-aware component startup.
//!
//! The coordinator launches components once what they depend on is running,
//! records every outcome in the registry and publishes a `LaunchCompleted`
//! event per attempt. It also owns restarts and stops, since both re-enter
//! the same start path.

mod activation;
mod coordinator;
mod launcher;
mod start_fn;

#[cfg(test)]
mod tests;

pub use activation::LaunchInstruction;
pub use coordinator::{ComponentSpec, StartupCoordinator, StartupReport};
pub use launcher::LaunchOutcome;
pub use start_fn::{StartFailure, StartFn};

use std::time::Duration;
use tokio::time::Instant;

/// `wait` from now; `None` when that lies beyond what an `Instant` can hold
fn deadline_after(wait: Duration) -> Option<Instant> {
    Instant::now().checked_add(wait)
}
