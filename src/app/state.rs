use super::Orchestrator;
use crate::context::LaunchStatus;
use crate::registry::{ComponentRecord, ComponentState};
use std::collections::HashMap;

impl Orchestrator {
    /// Lifecycle state of a component
    pub fn component_state(&self, id: &str) -> Option<ComponentState> {
        self.ctx.state_of(id)
    }

    pub fn launch_status(&self, id: &str) -> Option<LaunchStatus> {
        self.ctx.launch_status(id)
    }

    /// Snapshot of every registry record
    pub fn all_components(&self) -> Vec<ComponentRecord> {
        self.ctx.with_state(|s| s.registry.all())
    }

    pub fn state_summary(&self) -> HashMap<ComponentState, usize> {
        self.ctx.with_state(|s| s.registry.state_summary())
    }
}
