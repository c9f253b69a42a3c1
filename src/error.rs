use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Dependencies of {component} not satisfied after {timeout:?}: missing {missing:?}")]
    DependencyUnsatisfied {
        component: String,
        missing: Vec<String>,
        timeout: Duration,
    },

    #[error("Dependency {dependency} of {component} has failed")]
    DependencyFailed {
        component: String,
        dependency: String,
    },

    #[error("Launch of {component} timed out after {timeout:?}")]
    LaunchTimeout { component: String, timeout: Duration },

    #[error("Registration of {component} failed: {details}")]
    RegistrationFailure { component: String, details: String },

    #[error("Heartbeat for {component} failed: {details}")]
    HeartbeatFailure { component: String, details: String },

    #[error("Dependency cycle could not be resolved: {cycle:?}")]
    CycleUnresolvable { cycle: Vec<String> },

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },

    #[error("Receiver lagged behind by {skipped} events")]
    Lagged { skipped: u64 },

    #[error("Event channel closed")]
    ChannelClosed,
}

impl OrchestratorError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later can reasonably succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DependencyUnsatisfied { .. }
                | Self::LaunchTimeout { .. }
                | Self::RegistrationFailure { .. }
                | Self::HeartbeatFailure { .. }
                | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let transient = OrchestratorError::HeartbeatFailure {
            component: "hermes".to_string(),
            details: "connection refused".to_string(),
        };
        assert!(transient.is_recoverable());

        let fatal = OrchestratorError::DependencyFailed {
            component: "harmonia".to_string(),
            dependency: "hermes".to_string(),
        };
        assert!(!fatal.is_recoverable());
        assert!(fatal.to_string().contains("hermes"));
    }
}
