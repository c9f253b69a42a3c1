pub mod app;
pub mod bus;
pub mod config;
pub mod context;
pub mod deadlock;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod process;
pub mod recovery;
pub mod registry;
pub mod resolver;
pub mod startup;
pub mod transport;

pub use app::{Orchestrator, ShutdownReason};
pub use bus::{BusMessage, LocalMessageBus, MessageBus, COMPONENT_READY_TOPIC};
pub use config::{ActivationMode, ComponentManifest, OrchestratorConfig};
pub use context::{LaunchStatus, OrchestratorContext};
pub use deadlock::{DeadlockDetector, DeadlockReport};
pub use error::{EventBusError, OrchestratorError, Result};
pub use events::{EventBus, EventFilter, EventReceiver, OrchestratorEvent};
pub use heartbeat::{HeartbeatMonitor, HeartbeatWatcher};
pub use process::{ChildProcess, ProcessHandle, ProcessMonitor, ProcessStatus};
pub use recovery::{RecoveryAction, RecoveryConfig, RecoveryManager};
pub use registry::{ComponentRecord, ComponentRegistry, ComponentState, RegistrationOutcome};
pub use resolver::{check_dependencies_satisfied, BrokenCycle, DependencyEdge, DependencyResolver};
pub use startup::{
    ComponentSpec, LaunchInstruction, LaunchOutcome, StartFailure, StartFn, StartupCoordinator,
    StartupReport,
};
pub use transport::{HeartbeatRequest, HubTransport, LoopbackHub, RegistrationRequest, TransportError};
