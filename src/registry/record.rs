use super::ComponentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// One registered instance of a component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub component_id: String,
    pub instance_id: Uuid,
    pub state: ComponentState,
    pub dependencies: BTreeSet<String>,
    pub priority: i32,
    pub metadata: HashMap<String, String>,
    pub start_time: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub launcher_id: String,
}

impl ComponentRecord {
    /// Fresh record in `UNKNOWN` with a new instance id
    pub fn new(component_id: impl Into<String>, launcher_id: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            instance_id: Uuid::new_v4(),
            state: ComponentState::Unknown,
            dependencies: BTreeSet::new(),
            priority: 0,
            metadata: HashMap::new(),
            start_time: Utc::now(),
            last_heartbeat: None,
            launcher_id: launcher_id.into(),
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

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_state(mut self, state: ComponentState) -> Self {
        self.state = state;
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    /// Seconds since `start_time` as of `now`
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start_time).num_seconds()
    }

    /// Human-readable name, falling back to the component id
    pub fn display_name(&self) -> &str {
        self.metadata
            .get("name")
            .map(String::as_str)
            .unwrap_or(&self.component_id)
    }
}
