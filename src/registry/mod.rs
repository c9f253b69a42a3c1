//! Component registry and lifecycle state machine.
//!
//! The registry holds at most one [`ComponentRecord`] per `component_id`.
//! Every state change goes through the transition table in [`state`]; a
//! rejected transition leaves the record untouched and is only logged.

mod record;
mod state;


pub use record::ComponentRecord;
pub use state::ComponentState;

use crate::events::{EventBus, OrchestratorEvent};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Result of a registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// No record existed for the id
    Inserted,
    /// A record with an older or equal `start_time` was replaced
    Replaced,
    /// The incoming record was older than the stored one and was dropped
    RejectedStale,
}

/// In-memory store of component records
pub struct ComponentRegistry {
    records: HashMap<String, ComponentRecord>,
    event_bus: EventBus,
}

impl ComponentRegistry {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            records: HashMap::new(),
            event_bus,
        }
    }

    /// Register a record, keeping whichever of the stored and incoming records is newest
    pub fn register(&mut self, record: ComponentRecord) -> RegistrationOutcome {
        let id = record.component_id.clone();

        match self.records.get(&id) {
            None => {
                info!(
                    "Registered component {} (instance {})",
                    id, record.instance_id
                );
                self.records.insert(id, record);
                RegistrationOutcome::Inserted
            }
            Some(existing) if record.start_time < existing.start_time => {
                warn!(
                    "Rejected stale registration of {}: instance {} started at {} but {} started at {}",
                    id,
                    record.instance_id,
                    record.start_time,
                    existing.instance_id,
                    existing.start_time
                );
                RegistrationOutcome::RejectedStale
            }
            Some(existing) => {
                info!(
                    "Component {} re-registered: instance {} replaces {}",
                    id, record.instance_id, existing.instance_id
                );
                self.records.insert(id, record);
                RegistrationOutcome::Replaced
            }
        }
    }

    /// Apply a validated state transition.
    ///
    /// Returns `false` when the component is unknown or the edge is not in the table.
    pub fn update_state(&mut self, id: &str, new_state: ComponentState, reason: &str) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            warn!(
                "Cannot move unregistered component {} to {}: {}",
                id, new_state, reason
            );
            return false;
        };

        let old_state = record.state;
        if old_state == new_state {
            debug!("Component {} already {}", id, new_state);
            return true;
        }

        if !old_state.can_transition_to(new_state) {
            warn!(
                "Rejected transition of {} from {} to {} ({})",
                id, old_state, new_state, reason
            );
            return false;
        }

        record.state = new_state;
        info!("Component {}: {} -> {} ({})", id, old_state, new_state, reason);

        self.event_bus.emit(OrchestratorEvent::state_changed(
            id, old_state, new_state, reason,
        ));

        if new_state.is_alerting() {
            self.event_bus.emit(OrchestratorEvent::ComponentAlert {
                component_id: id.to_string(),
                state: new_state,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        }

        true
    }

    /// Walk the shortest table path towards `FAILED` from the current state
    pub fn escalate_to_failed(&mut self, id: &str, reason: &str) -> bool {
        let Some(state) = self.state_of(id) else {
            return false;
        };

        match state {
            ComponentState::Failed => true,
            ComponentState::Ready | ComponentState::Active => {
                self.update_state(id, ComponentState::Error, reason)
                    && self.update_state(id, ComponentState::Failed, reason)
            }
            ComponentState::Unknown => {
                self.update_state(id, ComponentState::Initializing, reason)
                    && self.update_state(id, ComponentState::Failed, reason)
            }
            _ => self.update_state(id, ComponentState::Failed, reason),
        }
    }

    pub fn record_heartbeat(&mut self, id: &str, at: DateTime<Utc>) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.last_heartbeat = Some(at);
                true
            }
            None => false,
        }
    }

    /// Explicitly change a record's priority
    pub fn update_priority(&mut self, id: &str, priority: i32) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.priority = priority;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&ComponentRecord> {
        self.records.get(id)
    }

    pub fn state_of(&self, id: &str) -> Option<ComponentState> {
        self.records.get(id).map(|r| r.state)
    }

    /// All records, sorted by component id
    pub fn all(&self) -> Vec<ComponentRecord> {
        let mut records: Vec<ComponentRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.component_id.cmp(&b.component_id));
        records
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn ids_in_state(&self, state: ComponentState) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.component_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn unregister(&mut self, id: &str) -> Option<ComponentRecord> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            info!("Unregistered component {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Count of records per state
    pub fn state_summary(&self) -> HashMap<ComponentState, usize> {
        let mut summary = HashMap::new();
        for record in self.records.values() {
            *summary.entry(record.state).or_insert(0) += 1;
        }
        summary
    }
}
