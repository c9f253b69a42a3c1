use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a registered component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentState {
    Unknown,
    Initializing,
    Ready,
    Active,
    Degraded,
    Error,
    Failed,
    Stopping,
    Restarting,
    Inactive,
}

use ComponentState::*;

/// Allowed edges of the lifecycle state machine.
///
/// `Stopping` is additionally reachable from every state, see [`ComponentState::can_transition_to`].
const TRANSITIONS: &[(ComponentState, &[ComponentState])] = &[
    (Unknown, &[Initializing]),
    (Initializing, &[Ready, Degraded, Failed, Restarting]),
    (Ready, &[Active, Degraded, Error, Stopping]),
    (Active, &[Ready, Degraded, Error, Stopping]),
    (Degraded, &[Ready, Error, Failed]),
    (Error, &[Degraded, Failed, Restarting]),
    (Failed, &[Restarting]),
    (Stopping, &[Inactive]),
    (Restarting, &[Initializing]),
    (Inactive, &[Initializing]),
];

impl ComponentState {
    pub const ALL: [ComponentState; 10] = [
        Unknown,
        Initializing,
        Ready,
        Active,
        Degraded,
        Error,
        Failed,
        Stopping,
        Restarting,
        Inactive,
    ];

    /// States reachable in one step from `self`
    pub fn allowed_targets(self) -> &'static [ComponentState] {
        TRANSITIONS
            .iter()
            .find(|(from, _)| *from == self)
            .map(|(_, targets)| *targets)
            .unwrap_or(&[])
    }

    pub fn can_transition_to(self, target: ComponentState) -> bool {
        if target == Stopping && self != Stopping {
            return true;
        }
        self.allowed_targets().contains(&target)
    }

    /// States that raise an alert when entered
    pub fn is_alerting(self) -> bool {
        matches!(self, Degraded | Error | Failed)
    }

    /// States in which the component serves its dependents
    pub fn is_available(self) -> bool {
        matches!(self, Ready | Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Unknown => "UNKNOWN",
            Initializing => "INITIALIZING",
            Ready => "READY",
            Active => "ACTIVE",
            Degraded => "DEGRADED",
            Error => "ERROR",
            Failed => "FAILED",
            Stopping => "STOPPING",
            Restarting => "RESTARTING",
            Inactive => "INACTIVE",
        }
    }
}

impl Default for ComponentState {
    fn default() -> Self {
        Unknown
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
