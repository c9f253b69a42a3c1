use crate::error::EventBusError;
use crate::registry::ComponentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, error, info, warn};

/// Events emitted by the orchestration core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A validated lifecycle transition was applied
    StateChanged {
        component_id: String,
        old_state: ComponentState,
        new_state: ComponentState,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A component entered DEGRADED, ERROR or FAILED
    ComponentAlert {
        component_id: String,
        state: ComponentState,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A launch attempt finished
    LaunchCompleted {
        component_id: String,
        success: bool,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Dependency cycles were broken by removing edges
    CyclesBroken {
        cycles: Vec<Vec<String>>,
        removed_edges: Vec<(String, String)>,
        timestamp: DateTime<Utc>,
    },
    /// A component stayed in INITIALIZING past the stuck threshold
    StuckComponent {
        component_id: String,
        elapsed_seconds: i64,
        timestamp: DateTime<Utc>,
    },
    /// A registry entry is not running and older than the orphan age
    OrphanDetected {
        component_id: String,
        age_seconds: i64,
        timestamp: DateTime<Utc>,
    },
    /// Hub availability flipped
    HubAvailabilityChanged {
        available: bool,
        timestamp: DateTime<Utc>,
    },
    /// Shutdown was requested
    ShutdownRequested {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    pub fn state_changed(
        component_id: &str,
        old_state: ComponentState,
        new_state: ComponentState,
        reason: &str,
    ) -> Self {
        OrchestratorEvent::StateChanged {
            component_id: component_id.to_string(),
            old_state,
            new_state,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn launch_completed(component_id: &str, success: bool, reason: Option<String>) -> Self {
        OrchestratorEvent::LaunchCompleted {
            component_id: component_id.to_string(),
            success,
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OrchestratorEvent::StateChanged { timestamp, .. }
            | OrchestratorEvent::ComponentAlert { timestamp, .. }
            | OrchestratorEvent::LaunchCompleted { timestamp, .. }
            | OrchestratorEvent::CyclesBroken { timestamp, .. }
            | OrchestratorEvent::StuckComponent { timestamp, .. }
            | OrchestratorEvent::OrphanDetected { timestamp, .. }
            | OrchestratorEvent::HubAvailabilityChanged { timestamp, .. }
            | OrchestratorEvent::ShutdownRequested { timestamp, .. } => *timestamp,
        }
    }

    /// Component the event is about, if any
    pub fn component_id(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::StateChanged { component_id, .. }
            | OrchestratorEvent::ComponentAlert { component_id, .. }
            | OrchestratorEvent::LaunchCompleted { component_id, .. }
            | OrchestratorEvent::StuckComponent { component_id, .. }
            | OrchestratorEvent::OrphanDetected { component_id, .. } => Some(component_id),
            _ => None,
        }
    }

    /// One-line summary used in logs
    pub fn description(&self) -> String {
        match self {
            OrchestratorEvent::StateChanged {
                component_id,
                old_state,
                new_state,
                reason,
                ..
            } => format!("{}: {} -> {} ({})", component_id, old_state, new_state, reason),
            OrchestratorEvent::ComponentAlert {
                component_id,
                state,
                reason,
                ..
            } => format!("{} is {}: {}", component_id, state, reason),
            OrchestratorEvent::LaunchCompleted {
                component_id,
                success,
                reason,
                ..
            } => match (success, reason) {
                (true, _) => format!("{} launched", component_id),
                (false, Some(reason)) => format!("{} failed to launch: {}", component_id, reason),
                (false, None) => format!("{} failed to launch", component_id),
            },
            OrchestratorEvent::CyclesBroken { removed_edges, .. } => {
                let edges: Vec<String> = removed_edges
                    .iter()
                    .map(|(from, to)| format!("{} -> {}", from, to))
                    .collect();
                format!("Broke dependency cycles by removing [{}]", edges.join(", "))
            }
            OrchestratorEvent::StuckComponent {
                component_id,
                elapsed_seconds,
                ..
            } => format!(
                "{} stuck in INITIALIZING for {}s",
                component_id, elapsed_seconds
            ),
            OrchestratorEvent::OrphanDetected {
                component_id,
                age_seconds,
                ..
            } => format!("{} is orphaned (registered {}s ago)", component_id, age_seconds),
            OrchestratorEvent::HubAvailabilityChanged { available, .. } => {
                format!("Hub {}", if *available { "available" } else { "unavailable" })
            }
            OrchestratorEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested ({})", reason)
            }
        }
    }

    /// Same as the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            OrchestratorEvent::StateChanged { .. } => "state_changed",
            OrchestratorEvent::ComponentAlert { .. } => "component_alert",
            OrchestratorEvent::LaunchCompleted { .. } => "launch_completed",
            OrchestratorEvent::CyclesBroken { .. } => "cycles_broken",
            OrchestratorEvent::StuckComponent { .. } => "stuck_component",
            OrchestratorEvent::OrphanDetected { .. } => "orphan_detected",
            OrchestratorEvent::HubAvailabilityChanged { .. } => "hub_availability_changed",
            OrchestratorEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }
}

/// Broadcast bus carrying [`OrchestratorEvent`]s to any number of subscribers.
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// `name` only labels the receiver in logs
    pub fn subscribe_filtered(&self, filter: EventFilter, name: &str) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), filter, name.to_string())
    }

    /// Publish an event to all subscribers.
    ///
    /// Never blocks, so it is safe to call while holding the control-state lock.
    pub fn publish(&self, event: OrchestratorEvent) -> Result<usize, EventBusError> {
        match &event {
            OrchestratorEvent::ComponentAlert { .. } => {
                warn!("{}", event.description());
            }
            OrchestratorEvent::LaunchCompleted { success: false, .. } => {
                error!("{}", event.description());
            }
            OrchestratorEvent::CyclesBroken { .. }
            | OrchestratorEvent::StuckComponent { .. }
            | OrchestratorEvent::OrphanDetected { .. } => {
                warn!("{}", event.description());
            }
            OrchestratorEvent::HubAvailabilityChanged { available, .. } => {
                if *available {
                    info!("{}", event.description());
                } else {
                    warn!("{}", event.description());
                }
            }
            OrchestratorEvent::ShutdownRequested { .. } => {
                info!("{}", event.description());
            }
            _ => debug!("event: {}", event.description()),
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Publish, ignoring the "no subscribers" case
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.publish(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

/// Which events an [`EventReceiver`] passes on
#[derive(Debug, Clone)]
pub enum EventFilter {
    All,
    /// Match on [`OrchestratorEvent::event_type`]
    EventTypes(Vec<&'static str>),
    /// Events about one of these components; events without a component never match
    Components(Vec<String>),
}

impl EventFilter {
    pub fn matches(&self, event: &OrchestratorEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(wanted) => wanted.contains(&event.event_type()),
            EventFilter::Components(components) => event
                .component_id()
                .map(|id| components.iter().any(|c| c == id))
                .unwrap_or(false),
        }
    }
}

/// Named receiver that skips events its filter rejects
pub struct EventReceiver {
    receiver: broadcast::Receiver<OrchestratorEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(
        receiver: broadcast::Receiver<OrchestratorEvent>,
        filter: EventFilter,
        name: String,
    ) -> Self {
        Self {
            receiver,
            filter,
            name,
        }
    }

    /// Wait for the next event passing the filter.
    ///
    /// A lag is reported once as [`EventBusError::Lagged`]; the receiver stays usable.
    pub async fn recv(&mut self) -> Result<OrchestratorEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("{} missed {} events", self.name, skipped);
                    return Err(EventBusError::Lagged { skipped });
                }
                Err(RecvError::Closed) => {
                    debug!("Event bus closed, {} stops receiving", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }

    /// Drain every buffered event that passes the filter
    pub fn drain(&mut self) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => events.push(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("{} missed {} events while draining", self.name, skipped);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        events
    }
}
