use super::deadline_after;
use super::start_fn::{StartFailure, StartFn};
use crate::bus::COMPONENT_READY_TOPIC;
use crate::context::{LaunchStatus, OrchestratorContext};
use crate::error::OrchestratorError;
use crate::events::OrchestratorEvent;
use crate::registry::ComponentState;
use crate::resolver::{check_dependencies_satisfied, BrokenCycle};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Everything needed to launch one component
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    pub start_fn: StartFn,
    pub dependencies: Vec<String>,
    /// Bound on the dependency wait
    pub timeout: Duration,
    pub priority: i32,
    pub metadata: BTreeMap<String, String>,
}

impl ComponentSpec {
    pub fn new(start_fn: StartFn) -> Self {
        Self {
            start_fn,
            dependencies: Vec::new(),
            timeout: Duration::from_secs(60),
            priority: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a batch launch
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    /// One entry per requested component
    pub results: BTreeMap<String, bool>,
    /// Launch order after cycle breaking
    pub order: Vec<String>,
    pub broken_cycles: Vec<BrokenCycle>,
}

impl StartupReport {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|ok| **ok).count()
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn had_cycles(&self) -> bool {
        !self.broken_cycles.is_empty()
    }

    pub fn failed(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn summary(&self) -> String {
        format!("{} of {} succeeded", self.succeeded(), self.total())
    }
}

/// Launches components once their dependencies run
pub struct StartupCoordinator {
    pub(super) ctx: Arc<OrchestratorContext>,
    pub(super) specs: Mutex<HashMap<String, ComponentSpec>>,
    /// Components whose trigger subscription is armed
    pub(super) triggers: Mutex<HashSet<String>>,
}

impl StartupCoordinator {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            specs: Mutex::new(HashMap::new()),
            triggers: Mutex::new(HashSet::new()),
        })
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    /// Remember how to launch a component and add it to the dependency graph
    pub fn register_spec(&self, id: &str, spec: ComponentSpec) {
        self.ctx.with_state(|s| {
            s.resolver
                .add_component(id, spec.dependencies.iter().cloned(), spec.priority);
            s.launch_status
                .entry(id.to_string())
                .or_insert(LaunchStatus::Pending);
        });
        self.specs.lock().insert(id.to_string(), spec);
    }

    pub fn spec(&self, id: &str) -> Option<ComponentSpec> {
        self.specs.lock().get(id).cloned()
    }

    /// Dependencies as currently held by the graph, falling back to the declared ones
    pub(super) fn effective_dependencies(&self, id: &str, declared: &[String]) -> Vec<String> {
        self.ctx.with_state(|s| {
            if s.resolver.contains(id) {
                s.resolver.dependencies_of(id)
            } else {
                declared.to_vec()
            }
        })
    }

    /// Launch one component after its dependencies are running.
    ///
    /// Never fails: every error ends in a FAILED record, a `false` result and
    /// a `LaunchCompleted` event.
    pub async fn start_component(
        &self,
        id: &str,
        start_fn: &StartFn,
        dependencies: &[String],
        timeout: Duration,
    ) -> bool {
        info!("Starting component {}", id);
        self.ctx.set_launch_status(id, LaunchStatus::Starting);
        self.begin_launch(id);

        if let Err(e) = self.wait_for_dependencies(id, dependencies, timeout).await {
            return self.finish_launch(id, Err(e.to_string())).await;
        }

        let result = start_fn.invoke(None).await.map_err(|f| f.to_string());
        self.finish_launch(id, result).await
    }

    /// Launch a registered component with its stored spec
    pub async fn start_registered(&self, id: &str) -> bool {
        let Some(spec) = self.spec(id) else {
            warn!("No start function registered for {}", id);
            return self
                .finish_launch(id, Err("no start function registered".to_string()))
                .await;
        };

        let dependencies = self.effective_dependencies(id, &spec.dependencies);
        self.start_component(id, &spec.start_fn, &dependencies, spec.timeout)
            .await
    }

    /// Launch a batch of components.
    ///
    /// Cycles are broken first. In ordered mode components start one after
    /// another in topological order; otherwise all at once, each waiting on
    /// its own dependencies.
    pub async fn start_components(
        &self,
        specs: BTreeMap<String, ComponentSpec>,
        ordered: bool,
    ) -> StartupReport {
        for (id, spec) in &specs {
            self.register_spec(id, spec.clone());
        }

        let (order, broken_cycles) = self.ctx.with_state(|s| {
            let broken = match s.resolver.resolve_cycles() {
                Ok(broken) => broken,
                Err(e) => {
                    error!("Starting with unresolved dependency cycle: {}", e);
                    Vec::new()
                }
            };
            (s.resolver.topological_order(), broken)
        });

        if !broken_cycles.is_empty() {
            self.ctx.event_bus().emit(OrchestratorEvent::CyclesBroken {
                cycles: broken_cycles.iter().map(|b| b.cycle.clone()).collect(),
                removed_edges: broken_cycles
                    .iter()
                    .map(|b| (b.removed_edge.from.clone(), b.removed_edge.to.clone()))
                    .collect(),
                timestamp: chrono::Utc::now(),
            });
        }

        let order: Vec<String> = order
            .into_iter()
            .filter(|id| specs.contains_key(id))
            .collect();

        info!(
            "Launching {} components ({}): {:?}",
            order.len(),
            if ordered { "ordered" } else { "parallel" },
            order
        );

        let mut results = BTreeMap::new();
        if ordered {
            let delay = self.ctx.config().startup.inter_launch_delay();
            for (index, id) in order.iter().enumerate() {
                if index > 0 && !delay.is_zero() {
                    sleep(delay).await;
                }
                let ok = self.start_registered(id).await;
                results.insert(id.clone(), ok);
            }
        } else {
            let launches = order.iter().map(|id| async move {
                let ok = self.start_registered(id).await;
                (id.clone(), ok)
            });
            results.extend(join_all(launches).await);
        }

        let report = StartupReport {
            results,
            order,
            broken_cycles,
        };
        info!("Startup finished: {}", report.summary());
        report
    }

    /// Put the record into INITIALIZING, creating a fresh one unless a restart prepared it
    pub(super) fn begin_launch(&self, id: &str) {
        let metadata = self.spec(id).map(|s| s.metadata).unwrap_or_default();
        let launcher_id = self.ctx.launcher_id().to_string();

        self.ctx.with_state(|s| match s.registry.state_of(id) {
            Some(ComponentState::Restarting) => {
                s.registry
                    .update_state(id, ComponentState::Initializing, "restarting");
            }
            Some(ComponentState::Initializing) => {
                debug!("{} is already initializing", id);
            }
            _ => {
                let mut record = s.fresh_record(id, &launcher_id);
                record.metadata.extend(metadata);
                s.registry.register(record);
                s.registry
                    .update_state(id, ComponentState::Initializing, "launching");
            }
        });
    }

    /// Poll until every dependency is in the running set or `timeout` elapses
    async fn wait_for_dependencies(
        &self,
        id: &str,
        dependencies: &[String],
        timeout: Duration,
    ) -> crate::error::Result<()> {
        let poll = self.ctx.config().startup.dependency_poll();
        // no deadline when the timeout is too large to represent
        let deadline = deadline_after(timeout);
        let shutdown = self.ctx.shutdown_token().clone();

        loop {
            let running = self.ctx.running_set();
            let (satisfied, missing) = check_dependencies_satisfied(id, dependencies, &running);
            if satisfied {
                return Ok(());
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(OrchestratorError::DependencyUnsatisfied {
                        component: id.to_string(),
                        missing,
                        timeout,
                    });
                }
                Some(deadline) => poll.min(deadline - now),
                None => poll,
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(OrchestratorError::component(id, "shutdown requested"));
                }
                _ = sleep(pause) => {}
            }
        }
    }

    /// Record the result of a launch in the registry and on the event bus
    pub(super) async fn finish_launch(&self, id: &str, result: Result<(), String>) -> bool {
        match result {
            Ok(()) => {
                self.ctx.with_state(|s| {
                    s.registry
                        .update_state(id, ComponentState::Ready, "start function succeeded");
                    s.set_launch_status(id, LaunchStatus::Running);
                });

                if let Some(bus) = self.ctx.message_bus() {
                    bus.publish(COMPONENT_READY_TOPIC, json!({ "component": id }));
                }

                match self.ctx.register_with_hub(id).await {
                    Ok(token) => debug!("{} registered with hub ({})", id, token),
                    Err(e) => warn!("{}", e),
                }

                info!("Component {} started", id);
                self.ctx
                    .event_bus()
                    .emit(OrchestratorEvent::launch_completed(id, true, None));
                true
            }
            Err(reason) => {
                self.ctx.with_state(|s| {
                    if s.registry.get(id).is_none() {
                        let record = s.fresh_record(id, self.ctx.launcher_id());
                        s.registry.register(record);
                    }
                    s.registry.escalate_to_failed(id, &reason);
                    s.set_launch_status(id, LaunchStatus::Failed);
                });

                error!("Component {} failed to start: {}", id, reason);
                self.ctx
                    .event_bus()
                    .emit(OrchestratorEvent::launch_completed(id, false, Some(reason)));
                false
            }
        }
    }

    /// Run a start function under the strict-path wall-clock bound
    pub(super) async fn invoke_bounded(&self, id: &str, start_fn: &StartFn) -> Result<(), String> {
        let limit = self.ctx.config().startup.launch_timeout();
        start_fn.invoke(Some(limit)).await.map_err(|failure| match failure {
            StartFailure::TimedOut(timeout) => OrchestratorError::LaunchTimeout {
                component: id.to_string(),
                timeout,
            }
            .to_string(),
            other => other.to_string(),
        })
    }
}
