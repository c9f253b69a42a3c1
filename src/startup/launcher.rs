use super::deadline_after;
use super::coordinator::StartupCoordinator;
use crate::context::LaunchStatus;
use crate::error::OrchestratorError;
use crate::process::terminate_gracefully;
use crate::registry::ComponentState;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Result of the strict launch path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Launched,
    /// Dependencies are still coming up; nothing was changed
    RetryLater,
    Failed(String),
}

impl StartupCoordinator {
    /// Launch a registered component only once its dependencies are READY or ACTIVE.
    ///
    /// A FAILED or unregistered dependency fails this component; dependencies
    /// still coming up after the readiness wait yield [`LaunchOutcome::RetryLater`].
    pub async fn launch_component(&self, id: &str) -> LaunchOutcome {
        let Some(spec) = self.spec(id) else {
            warn!("Cannot launch unknown component {}", id);
            return LaunchOutcome::Failed(format!("no start function registered for {}", id));
        };

        let dependencies = self.effective_dependencies(id, &spec.dependencies);
        let startup = &self.ctx.config().startup;
        let readiness_wait = startup.readiness_wait();
        let poll = startup.dependency_poll();
        let deadline = deadline_after(readiness_wait);

        loop {
            let states: Vec<(String, Option<ComponentState>)> = self.ctx.with_state(|s| {
                dependencies
                    .iter()
                    .map(|dep| (dep.clone(), s.registry.state_of(dep)))
                    .collect()
            });

            if let Some((failed, _)) = states
                .iter()
                .find(|(_, state)| *state == Some(ComponentState::Failed))
            {
                let reason = OrchestratorError::DependencyFailed {
                    component: id.to_string(),
                    dependency: failed.clone(),
                }
                .to_string();
                self.finish_launch(id, Err(reason.clone())).await;
                return LaunchOutcome::Failed(reason);
            }

            if states
                .iter()
                .all(|(_, state)| state.map(|s| s.is_available()).unwrap_or(false))
            {
                break;
            }

            let now = Instant::now();
            if deadline.map(|d| now >= d).unwrap_or(false) {
                let absent: Vec<String> = states
                    .iter()
                    .filter(|(_, state)| state.is_none())
                    .map(|(dep, _)| dep.clone())
                    .collect();

                if !absent.is_empty() {
                    let reason = OrchestratorError::DependencyUnsatisfied {
                        component: id.to_string(),
                        missing: absent,
                        timeout: readiness_wait,
                    }
                    .to_string();
                    self.finish_launch(id, Err(reason.clone())).await;
                    return LaunchOutcome::Failed(reason);
                }

                let pending: Vec<&str> = states
                    .iter()
                    .filter(|(_, state)| !state.map(|s| s.is_available()).unwrap_or(false))
                    .map(|(dep, _)| dep.as_str())
                    .collect();
                info!("{} deferred, dependencies not ready: {:?}", id, pending);
                return LaunchOutcome::RetryLater;
            }

            sleep(deadline.map(|d| poll.min(d - now)).unwrap_or(poll)).await;
        }

        self.ctx.set_launch_status(id, LaunchStatus::Starting);
        self.begin_launch(id);

        let result = self.invoke_bounded(id, &spec.start_fn).await;
        match result {
            Ok(()) => {
                self.finish_launch(id, Ok(())).await;
                LaunchOutcome::Launched
            }
            Err(reason) => {
                self.finish_launch(id, Err(reason.clone())).await;
                LaunchOutcome::Failed(reason)
            }
        }
    }

    /// Replace a component with a fresh instance.
    ///
    /// The record is walked to RESTARTING, any tracked process is terminated,
    /// a new record (new instance id) is registered and the start path re-runs.
    pub async fn restart_component(&self, id: &str, reason: &str) -> bool {
        info!("Restarting {}: {}", id, reason);

        let reached = self.ctx.with_state(|s| match s.registry.state_of(id) {
            None => false,
            Some(ComponentState::Restarting) => true,
            Some(ComponentState::Ready | ComponentState::Active | ComponentState::Degraded) => {
                s.registry.update_state(id, ComponentState::Error, reason)
                    && s.registry
                        .update_state(id, ComponentState::Restarting, reason)
            }
            Some(_) => s
                .registry
                .update_state(id, ComponentState::Restarting, reason),
        });

        if !reached {
            warn!("{} cannot be restarted from its current state", id);
            return false;
        }

        self.ctx.set_launch_status(id, LaunchStatus::Pending);

        if let Some(handle) = self.ctx.take_process(id) {
            let grace = self.ctx.config().deadlock.terminate_grace();
            let status = terminate_gracefully(handle, grace).await;
            debug!("Previous process of {} ended: {:?}", id, status);
        }

        let record = self
            .ctx
            .new_record(id)
            .with_state(ComponentState::Restarting);
        let instance = record.instance_id;
        self.ctx.register(record);
        info!("{} restarting as instance {}", id, instance);

        self.start_registered(id).await
    }

    /// Stop a component: STOPPING, terminate its process, INACTIVE
    pub async fn stop_component(&self, id: &str) -> bool {
        if !self
            .ctx
            .update_state(id, ComponentState::Stopping, "stop requested")
        {
            return false;
        }

        if let Some(handle) = self.ctx.take_process(id) {
            let grace = self.ctx.config().deadlock.terminate_grace();
            terminate_gracefully(handle, grace).await;
        }

        self.ctx.with_state(|s| {
            s.registry
                .update_state(id, ComponentState::Inactive, "stopped");
            s.set_launch_status(id, LaunchStatus::Stopped);
        });
        info!("Component {} stopped", id);
        true
    }
}
