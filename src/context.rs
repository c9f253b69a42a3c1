//! Shared orchestrator context.
//!
//! Everything the coordinator, heartbeat monitor, deadlock detector and
//! process monitor share lives here and is handed around as
//! `Arc<OrchestratorContext>`. The dependency graph, the registry and the
//! launch statuses sit behind one lock so that graph edits and state
//! transitions are always observed together.

use crate::bus::MessageBus;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::EventBus;
use crate::process::ProcessHandle;
use crate::registry::{ComponentRecord, ComponentRegistry, ComponentState, RegistrationOutcome};
use crate::resolver::DependencyResolver;
use crate::transport::{HubTransport, RegistrationRequest};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Coordinator-side view of a launch, independent of the registry state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStatus {
    Pending,
    Starting,
    Running,
    Failed,
    /// Waiting for a trigger topic
    Deferred,
    /// Launched only on explicit request
    Manual,
    Stopped,
}

/// Graph, registry and launch statuses, guarded together
pub struct ControlState {
    pub resolver: DependencyResolver,
    pub registry: ComponentRegistry,
    pub launch_status: BTreeMap<String, LaunchStatus>,
}

impl ControlState {
    /// Components whose launch completed and that have not stopped or failed since
    pub fn running_set(&self) -> HashSet<String> {
        self.launch_status
            .iter()
            .filter(|(_, status)| **status == LaunchStatus::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn set_launch_status(&mut self, id: &str, status: LaunchStatus) {
        debug!("Launch status of {}: {:?}", id, status);
        self.launch_status.insert(id.to_string(), status);
    }

    /// A fresh record seeded from the graph node and the previous record's metadata
    pub fn fresh_record(&self, id: &str, launcher_id: &str) -> ComponentRecord {
        let mut record = ComponentRecord::new(id, launcher_id);
        if self.resolver.contains(id) {
            record = record
                .with_dependencies(self.resolver.dependencies_of(id))
                .with_priority(self.resolver.priority_of(id));
        }
        if let Some(previous) = self.registry.get(id) {
            record.metadata = previous.metadata.clone();
        }
        record
    }
}

pub struct OrchestratorContext {
    config: OrchestratorConfig,
    launcher_id: String,
    state: Mutex<ControlState>,
    event_bus: EventBus,
    transport: Arc<dyn HubTransport>,
    message_bus: Option<Arc<dyn MessageBus>>,
    processes: Mutex<HashMap<String, Box<dyn ProcessHandle>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl OrchestratorContext {
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn HubTransport>,
        message_bus: Option<Arc<dyn MessageBus>>,
    ) -> Arc<Self> {
        let event_bus = EventBus::new(config.system.event_bus_capacity);
        let launcher_id = config
            .hub
            .launcher_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        info!("Orchestrator context created (launcher {})", launcher_id);

        Arc::new(Self {
            state: Mutex::new(ControlState {
                resolver: DependencyResolver::new(),
                registry: ComponentRegistry::new(event_bus.clone()),
                launch_status: BTreeMap::new(),
            }),
            config,
            launcher_id,
            event_bus,
            transport,
            message_bus,
            processes: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn launcher_id(&self) -> &str {
        &self.launcher_id
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn transport(&self) -> &Arc<dyn HubTransport> {
        &self.transport
    }

    pub fn message_bus(&self) -> Option<&Arc<dyn MessageBus>> {
        self.message_bus.as_ref()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Child token of the root shutdown token
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Run `f` with the control state locked. `f` must not block.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ControlState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    pub fn running_set(&self) -> HashSet<String> {
        self.with_state(|s| s.running_set())
    }

    pub fn state_of(&self, id: &str) -> Option<ComponentState> {
        self.with_state(|s| s.registry.state_of(id))
    }

    pub fn record(&self, id: &str) -> Option<ComponentRecord> {
        self.with_state(|s| s.registry.get(id).cloned())
    }

    pub fn update_state(&self, id: &str, new_state: ComponentState, reason: &str) -> bool {
        self.with_state(|s| s.registry.update_state(id, new_state, reason))
    }

    pub fn launch_status(&self, id: &str) -> Option<LaunchStatus> {
        self.with_state(|s| s.launch_status.get(id).copied())
    }

    pub fn set_launch_status(&self, id: &str, status: LaunchStatus) {
        self.with_state(|s| s.set_launch_status(id, status))
    }

    /// A fresh record owned by this launcher
    pub fn new_record(&self, id: &str) -> ComponentRecord {
        self.with_state(|s| s.fresh_record(id, &self.launcher_id))
    }

    pub fn register(&self, record: ComponentRecord) -> RegistrationOutcome {
        self.with_state(|s| s.registry.register(record))
    }

    /// Register a component with the remote hub
    pub async fn register_with_hub(&self, id: &str) -> Result<String> {
        let request = self
            .with_state(|s| s.registry.get(id).map(RegistrationRequest::from_record))
            .ok_or_else(|| OrchestratorError::RegistrationFailure {
                component: id.to_string(),
                details: "component is not registered locally".to_string(),
            })?;

        self.transport
            .register(&request)
            .await
            .map_err(|e| OrchestratorError::RegistrationFailure {
                component: id.to_string(),
                details: e.message,
            })
    }

    /// Track the process backing a component, replacing any previous handle
    pub fn track_process(&self, id: &str, handle: Box<dyn ProcessHandle>) {
        debug!("Tracking process {:?} for {}", handle.pid(), id);
        if self
            .processes
            .lock()
            .insert(id.to_string(), handle)
            .is_some()
        {
            warn!("Replaced tracked process of {}", id);
        }
    }

    /// Stop tracking a component's process and hand it to the caller
    pub fn take_process(&self, id: &str) -> Option<Box<dyn ProcessHandle>> {
        self.processes.lock().remove(id)
    }

    pub fn has_process(&self, id: &str) -> bool {
        self.processes.lock().contains_key(id)
    }

    /// Run `f` over every tracked process with the table locked
    pub fn with_processes<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Box<dyn ProcessHandle>>) -> R,
    ) -> R {
        let mut processes = self.processes.lock();
        f(&mut processes)
    }

    /// Spawn a background task owned by the context
    pub fn spawn_task<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((name.to_string(), handle));
        debug!("Spawned task {} ({} active)", name, tasks.len());
    }

    pub fn active_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.len()
    }

    /// Cancel the root token and wait for every task until `grace` elapses.
    ///
    /// Returns the number of tasks that had to be aborted.
    pub async fn shutdown_tasks(&self, grace: Duration) -> usize {
        self.shutdown.cancel();

        let tasks: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.tasks.lock());
        let deadline = Instant::now() + grace;
        let mut aborted = 0;

        for (name, mut handle) in tasks {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Task {} did not stop within {:?}, aborting", name, grace);
                handle.abort();
                aborted += 1;
            }
        }

        info!("Background tasks stopped ({} aborted)", aborted);
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackHub;

    fn create_context() -> Arc<OrchestratorContext> {
        OrchestratorContext::new(
            OrchestratorConfig::default(),
            Arc::new(LoopbackHub::new()),
            None,
        )
    }

    #[test]
    fn test_running_set_follows_launch_status() {
        let ctx = create_context();
        ctx.set_launch_status("a", LaunchStatus::Running);
        ctx.set_launch_status("b", LaunchStatus::Starting);
        ctx.set_launch_status("c", LaunchStatus::Running);
        ctx.set_launch_status("c", LaunchStatus::Failed);

        let running = ctx.running_set();
        assert_eq!(running.len(), 1);
        assert!(running.contains("a"));
    }

    #[test]
    fn test_new_record_uses_graph_node() {
        let ctx = create_context();
        ctx.with_state(|s| s.resolver.add_component("hermes", ["harmonia"], 4));

        let record = ctx.new_record("hermes");
        assert_eq!(record.launcher_id, ctx.launcher_id());
        assert_eq!(record.priority, 4);
        assert!(record.dependencies.contains("harmonia"));
        assert_eq!(record.state, ComponentState::Unknown);
    }

    #[test]
    fn test_configured_launcher_id_is_used() {
        let mut config = OrchestratorConfig::default();
        config.hub.launcher_id = Some("launcher-7".to_string());
        let ctx = OrchestratorContext::new(config, Arc::new(LoopbackHub::new()), None);
        assert_eq!(ctx.launcher_id(), "launcher-7");
    }

    #[tokio::test]
    async fn test_register_with_hub_requires_local_record() {
        let ctx = create_context();
        let result = ctx.register_with_hub("ghost").await;
        assert!(matches!(
            result,
            Err(OrchestratorError::RegistrationFailure { .. })
        ));

        ctx.register(ctx.new_record("hermes"));
        assert!(ctx.register_with_hub("hermes").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_tasks_aborts_stragglers() {
        let ctx = create_context();

        let token = ctx.child_token();
        ctx.spawn_task("cooperative", async move {
            token.cancelled().await;
        });
        ctx.spawn_task("stubborn", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(ctx.active_tasks(), 2);

        let aborted = ctx.shutdown_tasks(Duration::from_secs(1)).await;
        assert_eq!(aborted, 1);
        assert!(ctx.shutdown_token().is_cancelled());
        assert_eq!(ctx.active_tasks(), 0);
    }
}
