use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound for every timeout and wait setting, one week
pub const MAX_WAIT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub deadlock: DeadlockConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub system: SystemConfig,
    /// Components to launch, keyed by component id
    #[serde(default)]
    pub components: BTreeMap<String, ComponentManifest>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HubConfig {
    /// Base URL of the remote registry (informational for the loopback hub)
    #[serde(default = "default_hub_url")]
    pub url: String,

    /// Identity of this coordinator instance; generated when absent
    pub launcher_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats of one component
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Consecutive send failures that trigger a background re-registration
    #[serde(default = "default_failures_before_reregister")]
    pub failures_before_reregister: u32,

    /// Give up heartbeating after this many consecutive failures (unbounded when absent)
    pub max_failures: Option<u32>,

    /// Delay between re-registrations after the hub was found unavailable
    #[serde(default = "default_reconnect_stagger_ms")]
    pub reconnect_stagger_ms: u64,

    /// Consecutive missed heartbeats before a component is DEGRADED
    #[serde(default = "default_degraded_after_misses")]
    pub degraded_after_misses: u32,

    /// Consecutive missed heartbeats before a component is FAILED
    #[serde(default = "default_failed_after_misses")]
    pub failed_after_misses: u32,

    /// Restart FAILED components automatically
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,

    /// Upper bound of the name-derived restart jitter
    #[serde(default = "default_max_restart_jitter_ms")]
    pub max_restart_jitter_ms: u64,

    /// Salt the restart jitter with the attempt number
    #[serde(default)]
    pub jitter_per_attempt: bool,

    /// Automatic restarts allowed per component before giving up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StartupConfig {
    /// Launch in dependency order, one at a time
    #[serde(default = "default_ordered")]
    pub ordered: bool,

    /// Poll interval while waiting for dependencies
    #[serde(default = "default_dependency_poll_ms")]
    pub dependency_poll_ms: u64,

    /// Delay between sequential launches
    #[serde(default = "default_inter_launch_delay_ms")]
    pub inter_launch_delay_ms: u64,

    /// Dependency wait used when a component does not set its own timeout
    #[serde(default = "default_component_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Readiness wait of the strict launch path
    #[serde(default = "default_readiness_wait_secs")]
    pub readiness_wait_secs: u64,

    /// Wall-clock bound around a start function on the strict launch path
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeadlockConfig {
    #[serde(default = "default_deadlock_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Time in INITIALIZING after which a component counts as stuck
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,

    /// Age after which a non-running registry entry is flagged as orphaned
    #[serde(default = "default_orphan_age_secs")]
    pub orphan_age_secs: u64,

    /// Wait between terminate and kill of a stuck component's process
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProcessConfig {
    /// Exit-status polling interval of the process monitor
    #[serde(default = "default_process_poll_ms")]
    pub poll_interval_ms: u64,

    /// How long a spawned command must stay alive to count as started
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Bound on waiting for background tasks during shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// When a component is launched
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    #[default]
    Immediate,
    Trigger,
    Manual,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ComponentManifest {
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub priority: i32,

    /// Dependency wait for this component
    pub timeout_secs: Option<u64>,

    /// Executable to spawn
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub activation: ActivationMode,

    /// Topic that launches a `trigger` component
    pub trigger_topic: Option<String>,

    /// Extra metadata forwarded to the hub on registration
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl OrchestratorConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("conductor.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("hub.url", default_hub_url())?
            .set_default("heartbeat.retry_interval_ms", default_retry_interval_ms())?
            .set_default(
                "heartbeat.failures_before_reregister",
                default_failures_before_reregister(),
            )?
            .set_default(
                "heartbeat.reconnect_stagger_ms",
                default_reconnect_stagger_ms(),
            )?
            .set_default(
                "heartbeat.degraded_after_misses",
                default_degraded_after_misses(),
            )?
            .set_default("heartbeat.failed_after_misses", default_failed_after_misses())?
            .set_default("heartbeat.auto_restart", default_auto_restart())?
            .set_default(
                "heartbeat.max_restart_jitter_ms",
                default_max_restart_jitter_ms(),
            )?
            .set_default("heartbeat.jitter_per_attempt", false)?
            .set_default("heartbeat.max_restarts", default_max_restarts())?
            .set_default("startup.ordered", default_ordered())?
            .set_default("startup.dependency_poll_ms", default_dependency_poll_ms())?
            .set_default(
                "startup.inter_launch_delay_ms",
                default_inter_launch_delay_ms(),
            )?
            .set_default(
                "startup.default_timeout_secs",
                default_component_timeout_secs(),
            )?
            .set_default("startup.readiness_wait_secs", default_readiness_wait_secs())?
            .set_default("startup.launch_timeout_secs", default_launch_timeout_secs())?
            .set_default(
                "deadlock.check_interval_secs",
                default_deadlock_check_interval_secs(),
            )?
            .set_default(
                "deadlock.stuck_threshold_secs",
                default_stuck_threshold_secs(),
            )?
            .set_default("deadlock.orphan_age_secs", default_orphan_age_secs())?
            .set_default("deadlock.terminate_grace_ms", default_terminate_grace_ms())?
            .set_default("process.poll_interval_ms", default_process_poll_ms())?
            .set_default("process.settle_ms", default_settle_ms())?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default("system.shutdown_grace_secs", default_shutdown_grace_secs())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // CONDUCTOR_HEARTBEAT__RETRY_INTERVAL_MS=1000
            .add_source(
                Environment::with_prefix("CONDUCTOR")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: OrchestratorConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.retry_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Heartbeat retry_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat.failures_before_reregister == 0 {
            return Err(ConfigError::Message(
                "Heartbeat failures_before_reregister must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat.degraded_after_misses == 0 {
            return Err(ConfigError::Message(
                "Heartbeat degraded_after_misses must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat.failed_after_misses <= self.heartbeat.degraded_after_misses {
            return Err(ConfigError::Message(
                "Heartbeat failed_after_misses must be greater than degraded_after_misses"
                    .to_string(),
            ));
        }

        if self.startup.dependency_poll_ms == 0 {
            return Err(ConfigError::Message(
                "Startup dependency_poll_ms must be greater than 0".to_string(),
            ));
        }

        if self.deadlock.check_interval_secs == 0 {
            return Err(ConfigError::Message(
                "Deadlock check_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.process.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Process poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        for (name, secs) in [
            ("startup.default_timeout_secs", self.startup.default_timeout_secs),
            ("startup.readiness_wait_secs", self.startup.readiness_wait_secs),
            ("startup.launch_timeout_secs", self.startup.launch_timeout_secs),
            ("deadlock.check_interval_secs", self.deadlock.check_interval_secs),
            ("deadlock.stuck_threshold_secs", self.deadlock.stuck_threshold_secs),
            ("deadlock.orphan_age_secs", self.deadlock.orphan_age_secs),
            ("system.shutdown_grace_secs", self.system.shutdown_grace_secs),
        ] {
            if secs > MAX_WAIT_SECS {
                return Err(ConfigError::Message(format!(
                    "{} must not exceed {} seconds",
                    name, MAX_WAIT_SECS
                )));
            }
        }

        for (id, manifest) in &self.components {
            for dep in &manifest.dependencies {
                if !self.components.contains_key(dep) {
                    return Err(ConfigError::Message(format!(
                        "Component {} depends on undeclared component {}",
                        id, dep
                    )));
                }
            }

            if manifest.timeout_secs.map(|t| t > MAX_WAIT_SECS).unwrap_or(false) {
                return Err(ConfigError::Message(format!(
                    "Component {} timeout_secs must not exceed {} seconds",
                    id, MAX_WAIT_SECS
                )));
            }

            if manifest.activation == ActivationMode::Trigger && manifest.trigger_topic.is_none()
            {
                return Err(ConfigError::Message(format!(
                    "Component {} uses trigger activation without a trigger_topic",
                    id
                )));
            }
        }

        Ok(())
    }

    /// Dependency wait for a component
    pub fn component_timeout(&self, manifest: &ComponentManifest) -> Duration {
        Duration::from_secs(
            manifest
                .timeout_secs
                .unwrap_or(self.startup.default_timeout_secs),
        )
    }
}

impl HeartbeatConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// The hub probe runs at twice the heartbeat interval
    pub fn hub_probe_interval(&self) -> Duration {
        self.retry_interval() * 2
    }

    pub fn reconnect_stagger(&self) -> Duration {
        Duration::from_millis(self.reconnect_stagger_ms)
    }
}

impl StartupConfig {
    pub fn dependency_poll(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_ms)
    }

    pub fn inter_launch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_launch_delay_ms)
    }

    pub fn readiness_wait(&self) -> Duration {
        Duration::from_secs(self.readiness_wait_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }
}

impl DeadlockConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: default_hub_url(),
            launcher_id: None,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            failures_before_reregister: default_failures_before_reregister(),
            max_failures: None,
            reconnect_stagger_ms: default_reconnect_stagger_ms(),
            degraded_after_misses: default_degraded_after_misses(),
            failed_after_misses: default_failed_after_misses(),
            auto_restart: default_auto_restart(),
            max_restart_jitter_ms: default_max_restart_jitter_ms(),
            jitter_per_attempt: false,
            max_restarts: default_max_restarts(),
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            ordered: default_ordered(),
            dependency_poll_ms: default_dependency_poll_ms(),
            inter_launch_delay_ms: default_inter_launch_delay_ms(),
            default_timeout_secs: default_component_timeout_secs(),
            readiness_wait_secs: default_readiness_wait_secs(),
            launch_timeout_secs: default_launch_timeout_secs(),
        }
    }
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_deadlock_check_interval_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            orphan_age_secs: default_orphan_age_secs(),
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_process_poll_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            event_bus_capacity: default_event_bus_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

// Default value functions
fn default_hub_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_retry_interval_ms() -> u64 {
    5_000
}
fn default_failures_before_reregister() -> u32 {
    3
}
fn default_reconnect_stagger_ms() -> u64 {
    500
}
fn default_degraded_after_misses() -> u32 {
    2
}
fn default_failed_after_misses() -> u32 {
    5
}
fn default_auto_restart() -> bool {
    true
}
fn default_max_restart_jitter_ms() -> u64 {
    900
}
fn default_max_restarts() -> u32 {
    5
}

fn default_ordered() -> bool {
    true
}
fn default_dependency_poll_ms() -> u64 {
    1_000
}
fn default_inter_launch_delay_ms() -> u64 {
    1_000
}
fn default_component_timeout_secs() -> u64 {
    60
}
fn default_readiness_wait_secs() -> u64 {
    5
}
fn default_launch_timeout_secs() -> u64 {
    120
}

fn default_deadlock_check_interval_secs() -> u64 {
    60
}
fn default_stuck_threshold_secs() -> u64 {
    120
}
fn default_orphan_age_secs() -> u64 {
    300
}
fn default_terminate_grace_ms() -> u64 {
    1_000
}

fn default_process_poll_ms() -> u64 {
    2_000
}
fn default_settle_ms() -> u64 {
    500
}

fn default_event_bus_capacity() -> usize {
    256
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn manifest(deps: &[&str]) -> ComponentManifest {
        ComponentManifest {
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat.retry_interval(), Duration::from_secs(5));
        assert_eq!(config.heartbeat.hub_probe_interval(), Duration::from_secs(10));
        assert_eq!(config.startup.launch_timeout(), Duration::from_secs(120));
        assert_eq!(config.deadlock.stuck_threshold_secs, 120);
    }

    #[test]
    fn test_config_validation() {
        let mut config = OrchestratorConfig::default();
        config.heartbeat.failed_after_misses = 2;
        assert!(config.validate().is_err());

        config.heartbeat.failed_after_misses = 5;
        config
            .components
            .insert("harmonia".to_string(), manifest(&["hermes"]));
        assert!(config.validate().is_err());

        config.components.insert("hermes".to_string(), manifest(&[]));
        assert!(config.validate().is_ok());

        config.components.insert(
            "late".to_string(),
            ComponentManifest {
                activation: ActivationMode::Trigger,
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts_are_bounded() {
        let mut config = OrchestratorConfig::default();
        let mut m = manifest(&[]);
        m.timeout_secs = Some(u64::MAX);
        config.components.insert("hermes".to_string(), m);
        assert!(config.validate().is_err());

        config.components.get_mut("hermes").unwrap().timeout_secs = Some(MAX_WAIT_SECS);
        assert!(config.validate().is_ok());

        config.startup.launch_timeout_secs = MAX_WAIT_SECS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[heartbeat]
retry_interval_ms = 250

[startup]
ordered = false

[components.hermes]
command = "sleep"
args = ["30"]

[components.harmonia]
dependencies = ["hermes"]
priority = 2
activation = "trigger"
trigger_topic = "hermes.ready"
"#
        )
        .unwrap();

        let config = OrchestratorConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.heartbeat.retry_interval_ms, 250);
        assert_eq!(config.heartbeat.failed_after_misses, 5);
        assert!(!config.startup.ordered);
        assert_eq!(config.components.len(), 2);

        let harmonia = &config.components["harmonia"];
        assert_eq!(harmonia.dependencies, vec!["hermes"]);
        assert_eq!(harmonia.activation, ActivationMode::Trigger);
        assert_eq!(harmonia.priority, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_component_timeout_fallback() {
        let config = OrchestratorConfig::default();
        let mut m = manifest(&[]);
        assert_eq!(config.component_timeout(&m), Duration::from_secs(60));
        m.timeout_secs = Some(3);
        assert_eq!(config.component_timeout(&m), Duration::from_secs(3));
    }
}
