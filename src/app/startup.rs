use super::Orchestrator;
use crate::deadlock::DeadlockDetector;
use crate::process::ProcessMonitor;
use crate::startup::{ComponentSpec, LaunchInstruction, StartupReport};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

impl Orchestrator {
    /// Spawn the background loops and launch every registered component.
    ///
    /// Immediate components go through one batch launch; trigger and manual
    /// components only get their instruction applied.
    pub async fn start(&self) -> StartupReport {
        info!("Starting orchestrator (launcher {})", self.ctx.launcher_id());

        self.monitor.start();
        self.ctx.spawn_task(
            "heartbeat-watcher",
            Arc::clone(&self.watcher).run(self.ctx.child_token()),
        );
        self.ctx.spawn_task(
            "process-monitor",
            ProcessMonitor::new(Arc::clone(&self.ctx)).run(self.ctx.child_token()),
        );
        self.ctx.spawn_task(
            "deadlock-detector",
            DeadlockDetector::new(Arc::clone(&self.coordinator)).run(self.ctx.child_token()),
        );

        let instructions = self.instructions.lock().clone();
        let mut immediate: BTreeMap<String, ComponentSpec> = BTreeMap::new();
        let mut deferred = Vec::new();
        for (id, instruction) in instructions {
            match instruction {
                LaunchInstruction::Immediate => match self.coordinator.spec(&id) {
                    Some(spec) => {
                        immediate.insert(id, spec);
                    }
                    None => warn!("{} has no start function, skipping", id),
                },
                other => deferred.push((id, other)),
            }
        }

        let ordered = self.ctx.config().startup.ordered;
        let report = self.coordinator.start_components(immediate, ordered).await;

        for (id, instruction) in deferred {
            if !self.coordinator.apply_instruction(&id, instruction).await {
                warn!("Launch instruction for {} not applied", id);
            }
        }

        info!("Orchestrator started: {}", report.summary());
        report
    }

    /// Launch a registered component on request, typically a manual one
    pub async fn launch(&self, id: &str) -> bool {
        self.coordinator.start_registered(id).await
    }
}
