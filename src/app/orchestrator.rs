use super::types::ShutdownReason;
use crate::bus::MessageBus;
use crate::config::{ComponentManifest, OrchestratorConfig};
use crate::context::OrchestratorContext;
use crate::error::Result;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatWatcher};
use crate::process::command_start_fn;
use crate::startup::{ComponentSpec, LaunchInstruction, StartFn, StartupCoordinator};
use crate::transport::HubTransport;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Wires the coordinator, heartbeat loops and detectors around one context
pub struct Orchestrator {
    pub(super) ctx: Arc<OrchestratorContext>,
    pub(super) coordinator: Arc<StartupCoordinator>,
    pub(super) monitor: Arc<HeartbeatMonitor>,
    pub(super) watcher: Arc<HeartbeatWatcher>,

    /// How each registered component gets launched
    pub(super) instructions: Mutex<BTreeMap<String, LaunchInstruction>>,

    // Lifecycle management
    pub(super) shutdown_sender: Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>,
    pub(super) shutdown_receiver: Mutex<Option<oneshot::Receiver<ShutdownReason>>>,
}

impl Orchestrator {
    /// Validate the configuration and register every component it declares
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn HubTransport>,
        message_bus: Option<Arc<dyn MessageBus>>,
    ) -> Result<Self> {
        config.validate()?;

        let ctx = OrchestratorContext::new(config, transport, message_bus);
        let coordinator = StartupCoordinator::new(Arc::clone(&ctx));
        let monitor = HeartbeatMonitor::new(Arc::clone(&ctx));
        let watcher = HeartbeatWatcher::new(
            Arc::clone(&ctx),
            Some(Arc::clone(&coordinator)),
            Some(Arc::clone(&monitor)),
        );
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        let orchestrator = Self {
            ctx,
            coordinator,
            monitor,
            watcher,
            instructions: Mutex::new(BTreeMap::new()),
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_sender))),
            shutdown_receiver: Mutex::new(Some(shutdown_receiver)),
        };

        let manifests = orchestrator.ctx.config().components.clone();
        for (id, manifest) in &manifests {
            orchestrator.register_manifest(id, manifest);
        }
        info!("Orchestrator created with {} components", manifests.len());

        Ok(orchestrator)
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    pub fn coordinator(&self) -> &Arc<StartupCoordinator> {
        &self.coordinator
    }

    pub fn heartbeat_watcher(&self) -> &Arc<HeartbeatWatcher> {
        &self.watcher
    }

    /// Register a component with an explicit start function
    pub fn register_component(&self, id: &str, spec: ComponentSpec, instruction: LaunchInstruction) {
        debug!("Registering {} ({:?})", id, instruction);
        self.coordinator.register_spec(id, spec);
        self.instructions.lock().insert(id.to_string(), instruction);
    }

    /// Register a component from its manifest entry.
    ///
    /// Components without a command count as started as soon as their
    /// dependencies run.
    pub fn register_manifest(&self, id: &str, manifest: &ComponentManifest) {
        let config = self.ctx.config();
        let start_fn = match &manifest.command {
            Some(command) => command_start_fn(
                Arc::clone(&self.ctx),
                id,
                command,
                manifest.args.clone(),
                Duration::from_millis(config.process.settle_ms),
            ),
            None => StartFn::from_bool(true),
        };

        let mut spec = ComponentSpec::new(start_fn)
            .with_dependencies(manifest.dependencies.clone())
            .with_timeout(config.component_timeout(manifest))
            .with_priority(manifest.priority);
        for (key, value) in &manifest.metadata {
            spec = spec.with_metadata(key.clone(), value.clone());
        }

        self.register_component(id, spec, LaunchInstruction::from_manifest(manifest));
    }

    /// Order the components would start in, without touching the live graph
    pub fn startup_order(&self) -> (Vec<String>, bool) {
        let mut preview = self.ctx.with_state(|s| s.resolver.clone());
        preview.resolve_dependencies()
    }

    /// Ask a running orchestrator to shut down; `false` if already requested
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        match self.shutdown_sender.lock().take() {
            Some(sender) => sender.send(reason).is_ok(),
            None => false,
        }
    }
}
