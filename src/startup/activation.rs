use super::coordinator::StartupCoordinator;
use crate::config::{ActivationMode, ComponentManifest};
use crate::context::LaunchStatus;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// When a registered component gets launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchInstruction {
    Immediate,
    /// Launch on the first message published on `topic`
    Trigger { topic: String },
    /// Only record the intent; launched on explicit request
    Manual,
}

impl LaunchInstruction {
    pub fn from_manifest(manifest: &ComponentManifest) -> Self {
        match manifest.activation {
            ActivationMode::Immediate => LaunchInstruction::Immediate,
            ActivationMode::Trigger => LaunchInstruction::Trigger {
                topic: manifest.trigger_topic.clone().unwrap_or_default(),
            },
            ActivationMode::Manual => LaunchInstruction::Manual,
        }
    }
}

impl StartupCoordinator {
    /// Act on a launch instruction for a registered component.
    ///
    /// Arming a trigger twice keeps the single existing subscription. Returns
    /// `false` when the instruction could not be honoured.
    pub async fn apply_instruction(self: &Arc<Self>, id: &str, instruction: LaunchInstruction) -> bool {
        match instruction {
            LaunchInstruction::Immediate => self.start_registered(id).await,
            LaunchInstruction::Trigger { topic } => self.arm_trigger(id, &topic),
            LaunchInstruction::Manual => {
                info!("{} is manual, waiting for an explicit launch", id);
                self.ctx.set_launch_status(id, LaunchStatus::Manual);
                true
            }
        }
    }

    fn arm_trigger(self: &Arc<Self>, id: &str, topic: &str) -> bool {
        let Some(bus) = self.ctx.message_bus() else {
            warn!(
                "No message bus configured, trigger of {} on {} ignored",
                id, topic
            );
            return false;
        };

        if !self.triggers.lock().insert(id.to_string()) {
            debug!("Trigger of {} already armed", id);
            return true;
        }

        let mut receiver = bus.subscribe(topic);
        self.ctx.set_launch_status(id, LaunchStatus::Deferred);
        info!("{} will launch on first message on {}", id, topic);

        let coordinator = Arc::clone(self);
        let cancel = self.ctx.child_token();
        let component = id.to_string();
        let topic = topic.to_string();

        self.ctx.spawn_task(&format!("trigger:{}", id), async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Trigger of {} cancelled", component);
                }
                received = receiver.recv() => match received {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        info!("Trigger {} fired for {}", topic, component);
                        coordinator.start_registered(&component).await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Topic {} closed before {} was triggered", topic, component);
                    }
                },
            }
        });

        true
    }

    pub fn is_trigger_armed(&self, id: &str) -> bool {
        self.triggers.lock().contains(id)
    }
}
