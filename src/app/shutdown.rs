use super::{Orchestrator, ShutdownReason};
use crate::events::OrchestratorEvent;
use crate::registry::ComponentState;
use chrono::Utc;
use std::time::Duration;
use tracing::{error, info, warn};

impl Orchestrator {
    /// Stop background work, then every component in reverse dependency order.
    ///
    /// Returns the process exit code.
    pub async fn shutdown(&self, reason: ShutdownReason) -> i32 {
        info!("Beginning graceful shutdown ({})", reason);
        self.ctx.event_bus().emit(OrchestratorEvent::ShutdownRequested {
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });

        let mut exit_code = match reason {
            ShutdownReason::Error(_) => 1,
            _ => 0,
        };

        // no restarts may race the stops below
        self.monitor.stop().await;
        let grace = Duration::from_secs(self.ctx.config().system.shutdown_grace_secs);
        let aborted = self.ctx.shutdown_tasks(grace).await;
        if aborted > 0 {
            warn!("{} background tasks were aborted", aborted);
        }

        let mut order = self.ctx.with_state(|s| s.resolver.topological_order());
        order.reverse();

        for id in order {
            match self.ctx.state_of(&id) {
                None | Some(ComponentState::Inactive) => continue,
                Some(_) => {}
            }
            if !self.coordinator.stop_component(&id).await {
                error!("Error stopping component {}", id);
                exit_code = 1;
            }
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        exit_code
    }
}
